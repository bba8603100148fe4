//! Gateway startup and teardown.
//!
//! [`start_gateway`] bootstraps the TLS identity, binds the loopback
//! listener, builds the connection descriptor and router, and spawns the
//! server. The returned [`ServerHandle`] exposes what the caller needs to
//! announce the gateway and shuts everything down cleanly.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use axum_server::Handle;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::config::GatewayConfig;
use crate::server::bind::{bind_loopback, KeepAliveAcceptor, DEFAULT_KEEP_ALIVE};
use crate::server::connection::ConnectionDescriptor;
use crate::server::dispatch::Dispatcher;
use crate::server::events::EventBridge;
use crate::server::handlers::{EntityRegistries, OpenPolicy, UrlOpener};
use crate::server::http::{create_router, ApiState};
use crate::tls::{self, TlsError};

/// How long in-flight requests get to finish on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("failed to generate API token: {0}")]
    Token(#[from] getrandom::Error),

    #[error("invalid open allow-list pattern: {0}")]
    OpenPolicy(#[from] regex::Error),
}

/// Everything [`start_gateway`] needs besides the backend.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub dev_mode: bool,
    pub dev_port: u16,
    pub port: u16,
    /// Where to persist the certificate; `None` skips writing it.
    pub certificate_path: Option<PathBuf>,
    pub dev_origin: String,
    pub downloads_dir: Option<PathBuf>,
    pub keep_alive: Duration,
    /// Serve over TLS. Only tests turn this off.
    pub tls: bool,
}

impl GatewayOptions {
    /// Plain-HTTP options on an ephemeral port, for tests.
    pub fn for_testing() -> Self {
        Self {
            dev_mode: false,
            dev_port: 0,
            port: 0,
            certificate_path: None,
            dev_origin: crate::config::DEFAULT_DEV_ORIGIN.to_string(),
            downloads_dir: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            tls: false,
        }
    }
}

impl From<&GatewayConfig> for GatewayOptions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            dev_mode: config.dev_mode,
            dev_port: config.dev_port,
            port: config.port,
            certificate_path: Some(config.certificate_path.clone()),
            dev_origin: config.dev_origin.clone(),
            downloads_dir: config.downloads_dir(),
            keep_alive: config.keep_alive,
            tls: true,
        }
    }
}

/// Handle to a running gateway.
pub struct ServerHandle {
    local_addr: SocketAddr,
    tls: bool,
    descriptor: Arc<ConnectionDescriptor>,
    fingerprint: String,
    api: Arc<ApiState>,
    bridge: Arc<EventBridge>,
    handle: Handle,
    server_task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `https://127.0.0.1:port` (or `http://` when TLS is off).
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.local_addr)
    }

    pub fn descriptor(&self) -> &Arc<ConnectionDescriptor> {
        &self.descriptor
    }

    /// SHA-256 fingerprint of the certificate presented by the listener.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    pub fn registries(&self) -> &Arc<EntityRegistries> {
        self.api.registries()
    }

    /// Close all event sockets, stop accepting, and wait for the server task.
    pub async fn shutdown(self) {
        info!(target: "gateway", "shutting down");
        self.bridge.shutdown();
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

        match tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), self.server_task).await
        {
            Ok(Ok(Ok(()))) => info!(target: "gateway", "server stopped"),
            Ok(Ok(Err(e))) => error!(target: "gateway", error = %e, "server task returned error"),
            Ok(Err(e)) => error!(target: "gateway", error = %e, "server task panicked"),
            Err(_) => warn!(target: "gateway", "server task did not finish in time"),
        }
    }
}

/// Bootstrap and start the gateway.
///
/// Identity generation and binding are fatal; failing to persist the
/// certificate is only logged.
pub async fn start_gateway(
    options: GatewayOptions,
    backend: Arc<dyn Backend>,
    opener: Arc<dyn UrlOpener>,
) -> Result<ServerHandle, StartupError> {
    let identity = tls::generate_identity()?;
    let fingerprint = identity.fingerprint();
    let tls_config = if options.tls {
        Some(identity.server_config()?)
    } else {
        None
    };
    if let Some(path) = &options.certificate_path {
        if let Err(e) = tls::persist_certificate(&identity, path) {
            error!(target: "tls", error = %e, "failed to persist certificate; continuing");
        }
    }

    let requested = if options.dev_mode {
        options.dev_port
    } else {
        options.port
    };
    let listener = bind_loopback(requested).map_err(|source| StartupError::Bind {
        port: requested,
        source,
    })?;
    let local_addr = listener.local_addr().map_err(|source| StartupError::Bind {
        port: requested,
        source,
    })?;

    let descriptor = Arc::new(if options.dev_mode {
        ConnectionDescriptor::development()
    } else {
        ConnectionDescriptor::with_random_token(local_addr.port())?
    });

    let policy = OpenPolicy::new(options.downloads_dir.as_deref())?;
    let dispatcher = Dispatcher::new(options.dev_mode, &options.dev_origin);
    let api = Arc::new(ApiState::new(backend, opener, policy, dispatcher));
    let bridge = Arc::new(EventBridge::new());
    bridge.spawn_drain(api.start_backend());

    let app = create_router(api.clone(), bridge.clone(), descriptor.clone());
    let handle = Handle::new();
    let acceptor = KeepAliveAcceptor::new(options.keep_alive);

    let server_task = match tls_config {
        Some(config) => {
            let acceptor = RustlsAcceptor::new(RustlsConfig::from_config(config)).acceptor(acceptor);
            let server = axum_server::from_tcp(listener)
                .acceptor(acceptor)
                .handle(handle.clone());
            tokio::spawn(async move { server.serve(app.into_make_service()).await })
        }
        None => {
            let server = axum_server::from_tcp(listener)
                .acceptor(acceptor)
                .handle(handle.clone());
            tokio::spawn(async move { server.serve(app.into_make_service()).await })
        }
    };

    info!(
        target: "gateway",
        addr = %local_addr,
        dev_mode = options.dev_mode,
        tls = options.tls,
        fingerprint = %fingerprint,
        "gateway listening"
    );

    Ok(ServerHandle {
        local_addr,
        tls: options.tls,
        descriptor,
        fingerprint,
        api,
        bridge,
        handle,
        server_task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::server::handlers::SystemOpener;
    use tempfile::TempDir;

    #[test]
    fn test_options_from_config() {
        let config = GatewayConfig {
            port: 4000,
            keep_alive: Duration::from_secs(10),
            downloads_dir: Some(PathBuf::from("/dl")),
            ..GatewayConfig::default()
        };
        let options = GatewayOptions::from(&config);
        assert!(options.tls);
        assert_eq!(options.port, 4000);
        assert_eq!(options.keep_alive, Duration::from_secs(10));
        assert_eq!(options.downloads_dir, Some(PathBuf::from("/dl")));
        assert_eq!(
            options.certificate_path,
            Some(PathBuf::from("config/server.pem"))
        );
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("nested").join("server.pem");
        let options = GatewayOptions {
            certificate_path: Some(cert.clone()),
            ..GatewayOptions::for_testing()
        };

        let handle = start_gateway(
            options,
            Arc::new(MemoryBackend::new(false)),
            Arc::new(SystemOpener),
        )
        .await
        .unwrap();

        assert_ne!(handle.port(), 0);
        assert!(handle.local_addr().ip().is_loopback());
        assert!(handle.base_url().starts_with("http://127.0.0.1:"));
        assert_eq!(handle.descriptor().port(), i32::from(handle.port()));
        assert!(!handle.descriptor().is_dev());
        assert_eq!(handle.descriptor().token().len(), 64);
        assert!(cert.exists());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_dev_mode_uses_dev_port_and_dev_descriptor() {
        let scratch = bind_loopback(0).unwrap();
        let free = scratch.local_addr().unwrap().port();
        drop(scratch);

        let options = GatewayOptions {
            dev_mode: true,
            dev_port: free,
            port: 1,
            ..GatewayOptions::for_testing()
        };
        let handle = start_gateway(
            options,
            Arc::new(MemoryBackend::new(false)),
            Arc::new(SystemOpener),
        )
        .await
        .unwrap();

        assert_eq!(handle.port(), free);
        assert!(handle.descriptor().is_dev());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = bind_loopback(0).unwrap();
        let port = taken.local_addr().unwrap().port();
        let options = GatewayOptions {
            port,
            ..GatewayOptions::for_testing()
        };

        let result = start_gateway(
            options,
            Arc::new(MemoryBackend::new(false)),
            Arc::new(SystemOpener),
        )
        .await;
        assert!(matches!(result, Err(StartupError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_unwritable_certificate_path_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let options = GatewayOptions {
            certificate_path: Some(blocker.join("server.pem")),
            ..GatewayOptions::for_testing()
        };

        let handle = start_gateway(
            options,
            Arc::new(MemoryBackend::new(false)),
            Arc::new(SystemOpener),
        )
        .await
        .unwrap();
        handle.shutdown().await;
    }
}
