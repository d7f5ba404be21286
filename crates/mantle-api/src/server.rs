//! HTTPS listener

use std::net::SocketAddr;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ServerError;
use crate::frontend::{router, AppState};

/// How long in-flight requests may run after shutdown starts
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// PEM-encoded serving certificate and key
#[derive(Clone)]
pub struct TlsPem {
    /// Certificate chain PEM
    pub cert_pem: String,
    /// Private key PEM
    pub key_pem: String,
}

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// Serve TLS when set, plain HTTP otherwise
    pub tls: Option<TlsPem>,
    /// Grace period for in-flight requests on shutdown
    pub drain_timeout: Duration,
}

/// Serve the frontend until `shutdown` fires
///
/// Readiness turns on once the socket is bound. On shutdown the instance
/// first reports not ready, then stops accepting and drains.
pub async fn serve(
    config: ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = router(state.clone());
    let handle = Handle::new();

    let ready = {
        let handle = handle.clone();
        let state = state.clone();
        tokio::spawn(async move {
            if let Some(addr) = handle.listening().await {
                info!(addr = %addr, "frontend listening");
                state.mark_ready();
            }
        })
    };
    let drain = {
        let handle = handle.clone();
        let state = state.clone();
        let timeout = config.drain_timeout;
        tokio::spawn(async move {
            shutdown.cancelled().await;
            state.mark_unready();
            info!("draining frontend");
            handle.graceful_shutdown(Some(timeout));
        })
    };

    let served = match config.tls {
        Some(tls) => {
            let tls_config = RustlsConfig::from_pem(tls.cert_pem.into_bytes(), tls.key_pem.into_bytes())
                .await
                .map_err(|e| ServerError::Config(format!("TLS config error: {}", e)))?;
            axum_server::bind_rustls(config.addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        None => {
            warn!("serving without TLS");
            axum_server::bind(config.addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
    };

    ready.abort();
    drain.abort();
    state.mark_unready();
    served.map_err(|e| ServerError::Internal(e.to_string()))
}
