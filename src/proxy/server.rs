//! The interception engine: listener, per-connection dispatch, and the
//! settings refresh loop.
//!
//! The engine is a single OS process multiplexing every connection onto the
//! tokio reactor; each accepted connection runs in its own task. The only
//! state shared across connections is the certificate cache (append-only per
//! hostname) and the settings snapshot, which a background task refreshes
//! from the external store on a fixed cadence and publishes through a watch
//! channel. Connection handlers read the latest snapshot without locking.
//!
//! Shutdown (SIGTERM from the supervisor, or the shutdown channel in tests)
//! stops accepting and lets open connection tasks die with the process;
//! draining would risk leaving the OS proxy pointed at a half-dead engine.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::connect::{handle_connect, handle_http};
use super::error::ProxyError;
use super::router::DomainRouter;
use super::tls::CertificateCache;
use crate::ca::CertificateAuthority;
use crate::config::{EngineConfig, ProxySettings};
use crate::recorder::ActivityRecorder;
use crate::store::{ActivitySink, HttpStore, MemoryStore, SettingsStore};

/// Shared state visible to every exchange.
pub struct ExchangeContext {
    /// Domain router (static sets, pure lookup).
    pub router: DomainRouter,
    /// Certificate cache; None when the root CA failed to load, which
    /// degrades every inspect host to passthrough.
    pub cert_cache: Option<Arc<CertificateCache>>,
    /// Activity recorder (queued, best-effort).
    pub recorder: ActivityRecorder,
    /// Latest settings snapshot.
    pub settings_rx: watch::Receiver<ProxySettings>,
    /// OS user on whose behalf traffic is intercepted.
    pub user: String,
}

/// The interception engine server.
pub struct ProxyServer {
    config: EngineConfig,
    ctx: Arc<ExchangeContext>,
    settings_tx: watch::Sender<ProxySettings>,
    settings_store: Arc<dyn SettingsStore>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Assemble the engine from its configuration and store handles.
    pub fn new(
        config: EngineConfig,
        settings_store: Arc<dyn SettingsStore>,
        sink: Arc<dyn ActivitySink>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        // A corrupt or unreadable root CA must not take traffic handling
        // down; inspect hosts degrade to passthrough for this session.
        let cert_cache = match CertificateAuthority::get_or_create(&config.cert_dir) {
            Ok(ca) => Some(Arc::new(CertificateCache::new(Arc::new(ca)))),
            Err(e) => {
                error!(
                    "Root CA unavailable ({}); inspect hosts will be tunneled this session",
                    e
                );
                None
            }
        };

        let router = DomainRouter::new(
            &config.extra_inspect,
            &config.extra_bypass,
            &config.extra_passthrough,
        );

        let recorder = ActivityRecorder::new(sink, config.workspace.clone());

        let (settings_tx, settings_rx) = watch::channel(config.initial_settings());

        let ctx = Arc::new(ExchangeContext {
            router,
            cert_cache,
            recorder,
            settings_rx,
            user: whoami(),
        });

        Self {
            config,
            ctx,
            settings_tx,
            settings_store,
            shutdown_rx,
        }
    }

    /// Shared exchange context (for tests).
    pub fn context(&self) -> Arc<ExchangeContext> {
        self.ctx.clone()
    }

    /// Run the engine until the shutdown signal fires.
    pub async fn run(self) -> Result<(), ProxyError> {
        let addr = format!("127.0.0.1:{}", self.config.listen_port);
        let listener = TcpListener::bind(&addr).await?;

        info!("Interception engine listening on {}", addr);

        let refresh_handle = self.spawn_settings_refresh();

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            self.spawn_connection_handler(stream);
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Interception engine shutting down");
                        break;
                    }
                }
            }
        }

        refresh_handle.abort();
        Ok(())
    }

    /// Spawn a task to handle a single client connection.
    fn spawn_connection_handler(&self, stream: TcpStream) {
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
                let message = e.to_string();
                if message.contains("reset") || message.contains("broken pipe") {
                    debug!("Connection ended: {}", e);
                } else {
                    warn!("Connection error: {}", e);
                }
            }
        });
    }

    /// Spawn the settings refresh loop.
    ///
    /// Settings are re-read from the store on a fixed cadence, never cached
    /// indefinitely: an operator flipping the enforcement mode takes effect
    /// within one refresh interval, without restarting the engine. A failed
    /// read keeps the previous snapshot.
    fn spawn_settings_refresh(&self) -> tokio::task::JoinHandle<()> {
        let store = self.settings_store.clone();
        let tx = self.settings_tx.clone();
        let workspace = self.config.workspace.clone();
        let interval = self.config.settings_refresh;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.get_settings(&workspace).await {
                            Ok(settings) => {
                                if tx.send(settings).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!("Settings refresh failed, keeping last snapshot: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Serve one client connection with HTTP/1.1 + CONNECT upgrades.
async fn handle_connection(stream: TcpStream, ctx: Arc<ExchangeContext>) -> Result<(), ProxyError> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move { proxy_request(req, ctx).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

/// Route one proxy request: CONNECT tunnels, everything else plain HTTP.
async fn proxy_request(
    req: Request<Incoming>,
    ctx: Arc<ExchangeContext>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    if req.method() == Method::CONNECT {
        handle_connect(req, ctx).await
    } else {
        handle_http(req).await
    }
}

/// Run the interception engine process (the `internal-engine` subcommand).
///
/// Installs a SIGTERM handler so the supervisor's stop signal closes the
/// listener promptly; open connections are cut, not drained.
pub async fn run_engine(config: EngineConfig) -> Result<(), ProxyError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (settings_store, sink): (Arc<dyn SettingsStore>, Arc<dyn ActivitySink>) =
        if config.store_url.is_empty() {
            warn!("No store configured; settings and events stay in-process");
            let store = Arc::new(MemoryStore::with_settings(config.initial_settings()));
            (store.clone(), store)
        } else {
            let store = Arc::new(HttpStore::new(&config.store_url));
            (store.clone(), store)
        };

    #[cfg(unix)]
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };
            term.recv().await;
            info!("SIGTERM received, shutting down engine");
            let _ = shutdown_tx.send(true);
        });
    }

    let server = ProxyServer::new(config, settings_store, sink, shutdown_rx);
    server.run().await
}

/// OS user for activity event attribution.
fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_engine_config(cert_dir: PathBuf) -> EngineConfig {
        EngineConfig {
            listen_port: 0,
            cert_dir,
            workspace: "test".to_string(),
            store_url: String::new(),
            settings_refresh: Duration::from_secs(1),
            enforcement_mode: None,
            inspect_attachments: false,
            extra_inspect: vec![],
            extra_bypass: vec![],
            extra_passthrough: vec![],
        }
    }

    #[tokio::test]
    async fn test_server_creation_with_valid_ca() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (_tx, rx) = watch::channel(false);

        let server = ProxyServer::new(
            test_engine_config(dir.path().to_path_buf()),
            store.clone(),
            store,
            rx,
        );

        assert!(server.context().cert_cache.is_some());
    }

    #[tokio::test]
    async fn test_server_degrades_without_ca() {
        // Point the cert dir at corrupt root material.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(crate::ca::ROOT_CERT_FILE), "garbage").unwrap();
        std::fs::write(dir.path().join(crate::ca::ROOT_KEY_FILE), "garbage").unwrap();

        let store = Arc::new(MemoryStore::default());
        let (_tx, rx) = watch::channel(false);

        let server = ProxyServer::new(
            test_engine_config(dir.path().to_path_buf()),
            store.clone(),
            store,
            rx,
        );

        // Engine still constructs; inspect hosts will be tunneled.
        assert!(server.context().cert_cache.is_none());
    }

    #[tokio::test]
    async fn test_settings_refresh_publishes_store_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (_tx, rx) = watch::channel(false);

        let mut config = test_engine_config(dir.path().to_path_buf());
        config.settings_refresh = Duration::from_millis(20);

        let server = ProxyServer::new(config, store.clone(), store.clone(), rx);
        let ctx = server.context();
        let handle = server.spawn_settings_refresh();

        store.set_settings(ProxySettings {
            enforcement_mode: Some("block".to_string()),
            ..ProxySettings::default()
        });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = ctx.settings_rx.borrow().clone();
        assert_eq!(snapshot.enforcement_mode, Some("block".to_string()));

        handle.abort();
    }
}
