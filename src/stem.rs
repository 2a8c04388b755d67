//! Separable stems
//!
//! The fixed set of audio components the separation service can isolate.

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single isolable audio component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stem {
    Vocals,
    Drum,
    Bass,
    Piano,
    ElectricGuitar,
    AcousticGuitar,
    Synthesizer,
    Strings,
    Wind,
}

impl Stem {
    pub const ALL: [Stem; 9] = [
        Stem::Vocals,
        Stem::Drum,
        Stem::Bass,
        Stem::Piano,
        Stem::ElectricGuitar,
        Stem::AcousticGuitar,
        Stem::Synthesizer,
        Stem::Strings,
        Stem::Wind,
    ];

    /// Identifier sent to the separation service and echoed to clients
    pub fn as_str(&self) -> &'static str {
        match self {
            Stem::Vocals => "vocals",
            Stem::Drum => "drum",
            Stem::Bass => "bass",
            Stem::Piano => "piano",
            Stem::ElectricGuitar => "electric_guitar",
            Stem::AcousticGuitar => "acoustic_guitar",
            Stem::Synthesizer => "synthesizer",
            Stem::Strings => "strings",
            Stem::Wind => "wind",
        }
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Stem::Vocals => "Vocals",
            Stem::Drum => "Drums",
            Stem::Bass => "Bass",
            Stem::Piano => "Piano",
            Stem::ElectricGuitar => "Electric guitar",
            Stem::AcousticGuitar => "Acoustic guitar",
            Stem::Synthesizer => "Synthesizer",
            Stem::Strings => "Strings",
            Stem::Wind => "Wind",
        }
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stem {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "vocals" | "vocal" | "voice" => Ok(Stem::Vocals),
            "drum" | "drums" => Ok(Stem::Drum),
            "bass" => Ok(Stem::Bass),
            "piano" => Ok(Stem::Piano),
            "electric_guitar" => Ok(Stem::ElectricGuitar),
            "acoustic_guitar" => Ok(Stem::AcousticGuitar),
            "synthesizer" | "synth" => Ok(Stem::Synthesizer),
            "strings" => Ok(Stem::Strings),
            "wind" => Ok(Stem::Wind),
            _ => Err(ProxyError::InvalidStem(s.to_string())),
        }
    }
}
