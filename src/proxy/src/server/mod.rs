pub mod restart;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::metrics::metric_def::PROXY_ACTIVE_CONN;
use common::metrics::{common_labels, gauge_dec, gauge_inc};
use common::ShutdownMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::error::ProxyError;
use crate::pipeline::{self, PipelineConfig};

/// Process-wide shutdown/error signaling, constructed once in `main` and passed in
/// explicitly rather than read from module-level statics (§4.6, REDESIGN FLAGS §9).
pub struct ServerLifecycle {
    shutdown_tx: watch::Sender<ShutdownMessage>,
    error_tx: mpsc::UnboundedSender<ProxyError>,
    connections: AtomicU64,
    shutting_down: AtomicBool,
}

impl ServerLifecycle {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ProxyError>) {
        let (shutdown_tx, _keep_alive) = watch::channel(ShutdownMessage::Init);
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        (
            Arc::new(ServerLifecycle {
                shutdown_tx,
                error_tx,
                connections: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }),
            error_rx,
        )
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<ShutdownMessage> {
        self.shutdown_tx.subscribe()
    }

    pub fn on_connect(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        gauge_inc(PROXY_ACTIVE_CONN, 1.0, Some(common_labels()));
    }

    pub fn on_disconnect(&self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
        gauge_dec(PROXY_ACTIVE_CONN, 1.0, Some(common_labels()));
    }

    pub fn active_connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self, reason: String) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(ShutdownMessage::Cancel(reason));
    }

    /// The error-signal channel poison detection and fatal listener errors use to
    /// request a shutdown without the caller needing a `ServerLifecycle` reference.
    pub fn signal_error(&self, err: ProxyError) {
        let _ = self.error_tx.send(err);
    }

    /// Polls `activeConnections` down to zero, per §8's `WaitWithTimeout`: returns
    /// `true` on a clean drain, `false` if `timeout` elapsed with connections still open.
    pub async fn wait_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = tokio::time::interval(Duration::from_millis(50));
        loop {
            if self.active_connections() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            interval.tick().await;
        }
    }
}

/// Serves the admin HTTP API (§10.5) over an accepted connection. Implemented outside this
/// crate (by `web_service`) so the core gateway stays free of an HTTP framework dependency;
/// `server` only owns the listener lifecycle and restart plumbing.
#[async_trait]
pub trait AdminHandler: Send + Sync {
    async fn handle(&self, stream: TcpStream, lifecycle: Arc<ServerLifecycle>);
}

/// Owns both listeners and the accept loop (§4.6). `api_listener` is bound exactly when
/// `admin` is supplied, per the resolved open question binding the API listener's
/// existence to `enable_http_api || zonemode_enable` at construction time.
pub struct ServerState {
    pub lifecycle: Arc<ServerLifecycle>,
    pub pipeline_cfg: Arc<PipelineConfig>,
    pub admin: Option<Arc<dyn AdminHandler>>,
    pub drain_timeout: Duration,
}

impl ServerState {
    /// Binds (or inherits, on a graceful-restart child) both listeners and runs the
    /// accept loop until a shutdown or restart signal, returning the process exit code.
    pub async fn run(self, data_addr: SocketAddr, api_addr: Option<SocketAddr>) -> i32 {
        let restarting = restart::is_graceful_restart();

        let data_listener = match restart::inherit_or_bind(restart::DATA_FD, data_addr, restarting).await {
            Ok(l) => l,
            Err(e) => {
                error!("binding data listener on {data_addr}: {e}");
                return 1;
            }
        };
        let api_listener = match (self.admin.is_some(), api_addr) {
            (true, Some(addr)) => match restart::inherit_or_bind(restart::API_FD, addr, restarting).await {
                Ok(l) => Some(l),
                Err(e) => {
                    error!("binding api listener on {addr}: {e}");
                    return 1;
                }
            },
            _ => None,
        };

        info!(%data_addr, restarting, "proxy listening");
        self.accept_loop(data_listener, api_listener).await
    }

    async fn accept_loop(&self, data_listener: TcpListener, api_listener: Option<TcpListener>) -> i32 {
        let mut shutdown_rx = self.lifecycle.subscribe_shutdown();
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("registering SIGTERM handler: {e}");
                return 1;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("registering SIGINT handler: {e}");
                return 1;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!("registering SIGHUP handler: {e}");
                return 1;
            }
        };

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    self.lifecycle.begin_shutdown("SIGTERM".to_string());
                    break;
                }
                _ = sigint.recv() => {
                    self.lifecycle.begin_shutdown("SIGINT".to_string());
                    break;
                }
                _ = sighup.recv() => {
                    return self.graceful_restart(&data_listener, api_listener.as_ref()).await;
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
                accepted = data_listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_data_connection(stream, peer),
                        Err(e) => {
                            error!("data listener accept failed: {e}");
                            self.lifecycle.begin_shutdown(format!("accept error: {e}"));
                            break;
                        }
                    }
                }
                accepted = accept_optional(&api_listener) => {
                    match accepted {
                        Some(Ok((stream, _peer))) => self.spawn_admin_connection(stream),
                        Some(Err(e)) => warn!("api listener accept failed: {e}"),
                        None => {}
                    }
                }
            }
        }

        if self.lifecycle.wait_drain(self.drain_timeout).await {
            info!("graceful shutdown complete");
            0
        } else {
            warn!(
                active_connections = self.lifecycle.active_connections(),
                "drain timeout exceeded, exiting with connections still open"
            );
            1
        }
    }

    fn spawn_data_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let cfg = self.pipeline_cfg.clone();
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline::handle_connection(stream, cfg, lifecycle).await {
                warn!(%peer, code = e.code(), "connection ended with error: {e}");
            }
        });
    }

    fn spawn_admin_connection(&self, stream: TcpStream) {
        let Some(admin) = self.admin.clone() else { return };
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move { admin.handle(stream, lifecycle).await });
    }

    async fn graceful_restart(&self, data_listener: &TcpListener, api_listener: Option<&TcpListener>) -> i32 {
        info!("SIGHUP received, starting graceful restart");
        match restart::spawn_replacement(data_listener, api_listener) {
            Ok(child_pid) => info!(child_pid, "spawned replacement process"),
            Err(e) => {
                error!("graceful restart failed to spawn replacement: {e}");
                self.lifecycle
                    .signal_error(ProxyError::System(format!("graceful restart failed: {e}")));
            }
        }
        self.lifecycle.begin_shutdown("SIGHUP".to_string());
        if self.lifecycle.wait_drain(self.drain_timeout).await {
            0
        } else {
            1
        }
    }
}

async fn accept_optional(listener: &Option<TcpListener>) -> Option<std::io::Result<(TcpStream, SocketAddr)>> {
    match listener {
        Some(l) => Some(l.accept().await),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_counter_tracks_connect_and_disconnect() {
        let (lifecycle, _error_rx) = ServerLifecycle::new();
        assert_eq!(lifecycle.active_connections(), 0);
        lifecycle.on_connect();
        lifecycle.on_connect();
        assert_eq!(lifecycle.active_connections(), 2);
        lifecycle.on_disconnect();
        assert_eq!(lifecycle.active_connections(), 1);
    }

    #[tokio::test]
    async fn wait_drain_returns_true_once_counter_reaches_zero() {
        let (lifecycle, _error_rx) = ServerLifecycle::new();
        lifecycle.on_connect();
        let lifecycle2 = lifecycle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            lifecycle2.on_disconnect();
        });
        assert!(lifecycle.wait_drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn wait_drain_times_out_when_connections_never_close() {
        let (lifecycle, _error_rx) = ServerLifecycle::new();
        lifecycle.on_connect();
        assert!(!lifecycle.wait_drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn begin_shutdown_notifies_subscribers() {
        let (lifecycle, _error_rx) = ServerLifecycle::new();
        let mut rx = lifecycle.subscribe_shutdown();
        lifecycle.begin_shutdown("test".to_string());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ShutdownMessage::Cancel("test".to_string()));
    }
}
