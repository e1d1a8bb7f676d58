//! Gateway server

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::auth::AuthState;
use super::proxy::ReverseProxy;
use super::router::create_router;
use crate::config::Config;
use crate::identity::TokenVerifier;
use crate::{Error, Result};

/// Authenticating edge gateway
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Verification strategy shared by all listeners
    verifier: Arc<TokenVerifier>,
    /// Routing table, upstream clients and token sources
    proxy: Arc<ReverseProxy>,
}

impl Gateway {
    /// Build the verifier and proxy from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration selects a verifier that is not
    /// allowed, or any HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let verifier = Arc::new(TokenVerifier::from_config(&config)?);
        let proxy = Arc::new(ReverseProxy::from_config(&config)?);

        Ok(Self {
            config,
            verifier,
            proxy,
        })
    }

    /// Router for the public listener
    #[must_use]
    pub fn public_router(&self) -> Router {
        create_router(
            Arc::clone(&self.proxy),
            AuthState::public(Arc::clone(&self.verifier)),
            self.config.server.request_timeout,
        )
    }

    /// Router for the internal listener, which also honors `X-User-ID`
    #[must_use]
    pub fn internal_router(&self) -> Router {
        create_router(
            Arc::clone(&self.proxy),
            AuthState::internal(Arc::clone(&self.verifier)),
            self.config.server.request_timeout,
        )
    }

    /// Run until SIGINT/SIGTERM, then drain for at most `shutdown_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be bound or a server fails.
    pub async fn run(self) -> Result<()> {
        let public_addr = socket_addr(&self.config.server.host, self.config.server.port)?;
        let public_listener = TcpListener::bind(public_addr).await?;

        let internal_listener = if self.config.internal.enabled {
            let addr = socket_addr(&self.config.internal.host, self.config.internal.port)?;
            Some(TcpListener::bind(addr).await?)
        } else {
            None
        };

        self.log_startup();

        let (shutdown_tx, _) = broadcast::channel(1);

        let public = serve(public_listener, self.public_router(), shutdown_tx.subscribe());
        let internal_app = self.internal_router();
        let internal_rx = shutdown_tx.subscribe();
        let internal = async move {
            match internal_listener {
                Some(listener) => serve(listener, internal_app, internal_rx).await,
                None => Ok(()),
            }
        };

        let servers = async { tokio::try_join!(public, internal).map(|_| ()) };
        tokio::pin!(servers);

        tokio::select! {
            result = &mut servers => return result,
            () = shutdown_signal() => {}
        }

        info!(timeout = ?self.config.server.shutdown_timeout, "Shutdown signal received, draining");
        let _ = shutdown_tx.send(());

        match tokio::time::timeout(self.config.server.shutdown_timeout, servers).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Graceful shutdown timed out; dropping remaining connections");
                Ok(())
            }
        }
    }

    fn log_startup(&self) {
        info!("============================================================");
        info!("FOCUS GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            "Public listener"
        );
        if self.config.internal.enabled {
            warn!(
                host = %self.config.internal.host,
                port = self.config.internal.port,
                "Internal listener enabled - X-User-ID is trusted on this address"
            );
        }
        info!(mode = self.verifier.mode_name(), "Token verification");
        for route in self.proxy.routes().iter() {
            match route.upstream() {
                Some(upstream) => info!(
                    prefix = %route.path_prefix(),
                    upstream = %upstream.name(),
                    url = %upstream.base_url(),
                    "Route"
                ),
                None => warn!(
                    prefix = %route.path_prefix(),
                    upstream = %route.upstream_name(),
                    "Route has no configured upstream"
                ),
            }
        }
        info!("============================================================");
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip = host
        .parse::<IpAddr>()
        .map_err(|e| Error::Config(format!("Invalid host '{host}': {e}")))?;
    Ok(SocketAddr::new(ip, port))
}

async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
}
