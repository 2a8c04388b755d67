//! HTTP server module
//!
//! Binds the proxy's listening socket and serves every connection on its own
//! tokio task. All request-scoped state lives in [`App`], built once from the
//! configuration and shared by `Arc`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stem_proxy::config::Config;
//! use stem_proxy::server::{App, ProxyServer};
//! use stem_proxy::upstream::HttpSeparationClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("config.yaml")?;
//! let upstream = Arc::new(HttpSeparationClient::new(&config.upstream)?);
//! let app = Arc::new(App::new(&config, upstream));
//! let server = ProxyServer::bind(&config.server.address, app).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod handler;
pub mod identity;
pub mod response;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::authorizer::UploadAuthorizer;
use crate::config::{Config, ProcessingMode};
use crate::jobs::JobTable;
use crate::orchestrator::SeparationOrchestrator;
use crate::quota::QuotaStore;
use crate::status::StatusEndpoint;
use crate::upstream::SeparationService;
use response::Responder;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    RuntimeError(String),
}

/// Shared state behind every request
pub struct App {
    pub(crate) quota: Arc<QuotaStore>,
    pub(crate) jobs: Arc<JobTable>,
    pub(crate) authorizer: UploadAuthorizer,
    pub(crate) orchestrator: SeparationOrchestrator,
    pub(crate) status: StatusEndpoint,
    pub(crate) responder: Responder,
    pub(crate) mode: ProcessingMode,
    pub(crate) trust_forwarded: bool,
    pub(crate) max_file_size: u64,
}

impl App {
    /// Build the stores and components from configuration
    pub fn new(config: &Config, upstream: Arc<dyn SeparationService>) -> Self {
        let quota = Arc::new(QuotaStore::new(
            config.limits.daily_limit,
            config.quota.exempt.iter().cloned(),
            Duration::from_secs(config.quota.max_in_flight_seconds),
        ));
        Self::with_quota(config, upstream, quota)
    }

    /// Build around an existing quota store
    pub fn with_quota(
        config: &Config,
        upstream: Arc<dyn SeparationService>,
        quota: Arc<QuotaStore>,
    ) -> Self {
        let jobs = Arc::new(JobTable::new(
            quota.clone(),
            Duration::from_secs(config.jobs.ttl_seconds),
        ));

        let authorizer = UploadAuthorizer::new(
            quota.clone(),
            config.limits.clone(),
            UploadAuthorizer::signer_for(&config.upstream),
            upstream.clone(),
        );
        let orchestrator = SeparationOrchestrator::new(
            quota.clone(),
            jobs.clone(),
            upstream.clone(),
            config.poll.clone(),
        );
        let status = StatusEndpoint::new(quota.clone(), jobs.clone(), upstream);

        Self {
            quota,
            jobs,
            authorizer,
            orchestrator,
            status,
            responder: Responder::new(&config.server.cors_allow_origin),
            mode: config.server.mode,
            trust_forwarded: config.server.trust_forwarded_headers,
            max_file_size: config.limits.max_file_size,
        }
    }

    pub fn quota(&self) -> &Arc<QuotaStore> {
        &self.quota
    }

    pub fn jobs(&self) -> &Arc<JobTable> {
        &self.jobs
    }

    /// Start the quota and job sweeps
    pub fn spawn_maintenance(&self, config: &Config) -> Vec<JoinHandle<()>> {
        vec![
            self.quota
                .clone()
                .spawn_sweeper(Duration::from_secs(config.quota.sweep_interval_seconds)),
            self.jobs
                .clone()
                .spawn_sweeper(Duration::from_secs(config.jobs.sweep_interval_seconds)),
        ]
    }
}

/// Proxy HTTP server
pub struct ProxyServer {
    app: Arc<App>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyServer {
    /// Bind the listening socket; port 0 picks a free port
    pub async fn bind(address: &str, app: Arc<App>) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!("Server bound to {}", local_addr);

        Ok(Self {
            app,
            listener,
            local_addr,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections forever
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!("Starting proxy server on {}", self.local_addr);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down proxy server");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let app = Arc::clone(&self.app);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let app = Arc::clone(&app);
                    handler::handle_request(req, peer_addr, app)
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::upstream::MockSeparationService;

    fn app() -> Arc<App> {
        Arc::new(App::new(&test_config(), Arc::new(MockSeparationService::new())))
    }

    #[tokio::test]
    async fn test_bind_port_zero() {
        let server = ProxyServer::bind("127.0.0.1:0", app()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let result = ProxyServer::bind("invalid", app()).await;
        assert!(matches!(result, Err(ServerError::BindError(_))));
    }

    #[tokio::test]
    async fn test_run_until_stops() {
        let server = ProxyServer::bind("127.0.0.1:0", app()).await.unwrap();
        let result = server.run_until(async {}).await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_app_uses_configured_limit() {
        let mut config = test_config();
        config.limits.daily_limit = 7;
        let app = App::new(&config, Arc::new(MockSeparationService::new()));
        assert_eq!(app.quota().daily_limit(), 7);
        assert!(app.jobs().is_empty());
    }
}
