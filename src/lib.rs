//! Stem Proxy Library
//!
//! Quota-aware proxy in front of a remote audio stem-separation service.
//!
//! # Features
//!
//! - **Daily Quota**: Per-client counters with one job in flight at a time
//! - **Release on Failure**: Failed separations never consume quota
//! - **Presigned Uploads**: Clients upload straight to the service with a signed ticket
//! - **Sync or Deferred**: Poll to completion in the request, or let clients poll
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stem_proxy::{config::Config, server::{App, ProxyServer}, upstream::HttpSeparationClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let upstream = Arc::new(HttpSeparationClient::new(&config.upstream)?);
//!     let app = Arc::new(App::new(&config, upstream));
//!     ProxyServer::bind(&config.server.address, app).await?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod authorizer;
pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod quota;
pub mod server;
pub mod status;
pub mod stem;
pub mod upstream;

// Re-export commonly used types
pub use config::Config;
pub use error::{ErrorKind, ProxyError};
pub use server::{App, ProxyServer};
pub use stem::Stem;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
