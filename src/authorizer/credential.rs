//! Presigned upload tickets
//!
//! A ticket lets the browser push file bytes straight to the separation
//! service without the proxy ever holding the API key on the client side.
//! The canonical string
//!
//! ```text
//! identity \n filename \n size \n expires \n nonce
//! ```
//!
//! is signed with HMAC-SHA256 under a secret shared with the service. The
//! token is `base64url(canonical).hex(signature)`; the upload URL carries the
//! same values as query parameters.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Ticket verification errors
#[derive(Error, Debug, PartialEq)]
pub enum CredentialError {
    #[error("Malformed credential: {0}")]
    Malformed(String),

    #[error("Credential signature mismatch")]
    BadSignature,

    #[error("Credential expired")]
    Expired,

    #[error("Signing key rejected: {0}")]
    InvalidKey(String),

    #[error("Ticket lifetime {0:?} is out of range")]
    InvalidTtl(Duration),
}

/// Credential handed to the client after a successful authorization
#[derive(Debug, Clone, Serialize)]
pub struct UploadCredential {
    pub token: String,
    pub upload_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Values bound into a ticket
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialClaims {
    pub identity: String,
    pub filename: String,
    pub size: u64,
    /// Unix seconds
    pub expires: i64,
    pub nonce: String,
}

impl CredentialClaims {
    fn canonical(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.identity, self.filename, self.size, self.expires, self.nonce
        )
    }

    fn parse(canonical: &str) -> Result<Self, CredentialError> {
        let parts: Vec<&str> = canonical.split('\n').collect();
        let [identity, filename, size, expires, nonce] = parts.as_slice() else {
            return Err(CredentialError::Malformed(format!(
                "expected 5 fields, found {}",
                parts.len()
            )));
        };

        Ok(Self {
            identity: identity.to_string(),
            filename: filename.to_string(),
            size: size
                .parse()
                .map_err(|_| CredentialError::Malformed("size is not a number".into()))?,
            expires: expires
                .parse()
                .map_err(|_| CredentialError::Malformed("expiry is not a number".into()))?,
            nonce: nonce.to_string(),
        })
    }
}

/// Mints and checks presigned upload tickets
#[derive(Clone)]
pub struct CredentialSigner {
    secret: Vec<u8>,
    upload_url: String,
    ttl: Duration,
}

impl std::fmt::Debug for CredentialSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSigner")
            .field("upload_url", &self.upload_url)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl CredentialSigner {
    /// `upload_url` is the service endpoint the ticket is valid for
    pub fn new(secret: &str, upload_url: &str, ttl: Duration) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            upload_url: upload_url.to_string(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn sign(&self, canonical: &str) -> Result<Vec<u8>, CredentialError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        mac.update(canonical.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Issue a ticket valid from now
    pub fn issue(
        &self,
        identity: &str,
        filename: &str,
        size: u64,
    ) -> Result<UploadCredential, CredentialError> {
        self.issue_at(identity, filename, size, Utc::now())
    }

    /// Issue a ticket as of `now`
    pub fn issue_at(
        &self,
        identity: &str,
        filename: &str,
        size: u64,
        now: DateTime<Utc>,
    ) -> Result<UploadCredential, CredentialError> {
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| CredentialError::InvalidTtl(self.ttl))?;

        let claims = CredentialClaims {
            identity: identity.to_string(),
            // Newlines would break the canonical form
            filename: filename.chars().filter(|c| !c.is_control()).collect(),
            size,
            expires: expires_at.timestamp(),
            nonce: uuid::Uuid::new_v4().simple().to_string(),
        };

        let canonical = claims.canonical();
        let signature = hex::encode(self.sign(&canonical)?);
        let token = format!("{}.{}", URL_SAFE_NO_PAD.encode(&canonical), signature);

        let size = claims.size.to_string();
        let expires = claims.expires.to_string();
        let query = [
            ("identity", claims.identity.as_str()),
            ("filename", claims.filename.as_str()),
            ("size", size.as_str()),
            ("expires", expires.as_str()),
            ("nonce", claims.nonce.as_str()),
            ("signature", signature.as_str()),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}", k, utf8_percent_encode(v, NON_ALPHANUMERIC)))
        .collect::<Vec<_>>()
        .join("&");

        Ok(UploadCredential {
            token,
            upload_url: format!("{}?{}", self.upload_url, query),
            expires_at,
        })
    }

    /// Check a token's signature and expiry
    pub fn verify(&self, token: &str) -> Result<CredentialClaims, CredentialError> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<CredentialClaims, CredentialError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| CredentialError::Malformed("missing signature".into()))?;

        let canonical = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        let canonical = String::from_utf8(canonical)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        let signature =
            hex::decode(signature).map_err(|e| CredentialError::Malformed(e.to_string()))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        mac.update(canonical.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CredentialError::BadSignature)?;

        let claims = CredentialClaims::parse(&canonical)?;
        if claims.expires <= now.timestamp() {
            return Err(CredentialError::Expired);
        }
        Ok(claims)
    }
}
