//! Gateway server implementation

pub mod forward;
pub mod router;

pub use forward::{CallerContext, HttpToolBackend, RelayedResponse, ToolBackend};
pub use router::{AppState, SERVICE_NAME, create_router};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::auth::AuthStrategy;
use crate::auth::session::SessionProvider;
use crate::config::Config;
use crate::{Error, Result};

/// The property gateway server.
///
/// Constructed from configuration; collaborators that cannot come from
/// configuration (the session provider, or a non-HTTP tool backend) are
/// injected before `run`.
pub struct Gateway {
    config: Config,
    sessions: Option<Arc<dyn SessionProvider>>,
    tools: Option<Arc<dyn ToolBackend>>,
}

impl Gateway {
    /// Create a gateway over the given configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sessions: None,
            tools: None,
        }
    }

    /// Supply the session/authorization provider collaborator.
    ///
    /// Required for the delegated-OAuth mode; ignored by the others.
    #[must_use]
    pub fn with_session_provider(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Replace the HTTP relay with a custom tool backend
    #[must_use]
    pub fn with_tool_backend(mut self, tools: Arc<dyn ToolBackend>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.upstream.timeout_secs.max(1)))
            .build()?;

        let tools = match self.tools {
            Some(tools) => tools,
            None => {
                if self.config.upstream.url.is_empty() {
                    return Err(Error::Config(
                        "upstream.url must be set (or a tool backend injected)".to_string(),
                    ));
                }
                Arc::new(HttpToolBackend::new(
                    self.config.upstream.url.clone(),
                    http.clone(),
                    Duration::from_secs(self.config.upstream.timeout_secs),
                ))
            }
        };

        let strategy = AuthStrategy::from_config(&self.config.auth, http, self.sessions)?;
        let mode = strategy.mode();

        let state = Arc::new(AppState {
            strategy,
            tools,
            public_url: self.config.server.public_url.clone(),
        });

        let app = create_router(Arc::clone(&state), &self.config.server.cors_origin);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("PROPERTY GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        info!(auth = %mode, upstream = %self.config.upstream.url, "Routing");
        for endpoint in state.endpoints() {
            info!("  {endpoint}");
        }
        if mode == "none" {
            warn!("AUTHENTICATION disabled - gateway is open to all requests");
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway shutdown complete");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
