use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use common::profiling::head_profiler::{HeapProfileOpts, HeapProfiler};
use common::profiling::prof::Prof;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use proxy::server::{AdminHandler, ServerLifecycle};
use tokio::net::TcpStream;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::warn;

use crate::http_handler::{
    dump_mem_profile, health, heap_analysis, list_cpu_profile, print_cpu_prof, route_metrics,
    start_cpu_prof, stop_cpu_prof, MetricsHandler,
};

/// Per-connection admin state (§10.5). CPU/heap profilers are process-wide singletons
/// (the host crate keeps them behind `OnceLock`s too); `lifecycle` is the one thing that
/// actually varies and is handed in fresh by `ServerState` on every accepted connection.
#[derive(Clone)]
pub struct AdminState {
    pub lifecycle: Arc<ServerLifecycle>,
}

impl AdminState {
    pub fn cpu_profile(&self) -> &'static Prof {
        static CPU_PROF: std::sync::OnceLock<Prof> = std::sync::OnceLock::new();
        CPU_PROF.get_or_init(Prof::default)
    }

    pub fn memory_profile(&self) -> Result<&HeapProfiler, anyhow::Error> {
        static HEAP_PROF: std::sync::OnceLock<HeapProfiler> = std::sync::OnceLock::new();
        HEAP_PROF.get_or_try_init(|| HeapProfiler::new_with_opts(HeapProfileOpts::default()))
    }
}

fn build_router(state: AdminState, enable_metrics: bool) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/debug/pprof/profile", get(start_cpu_prof))
        .route("/debug/pprof/profile/stop", get(stop_cpu_prof))
        .route("/debug/pprof/profile/list", get(list_cpu_profile))
        .route("/debug/pprof/profile/view", get(print_cpu_prof))
        .route("/debug/pprof/heap", get(dump_mem_profile))
        .route("/debug/pprof/heap/analysis/:dump_path", get(heap_analysis))
        .with_state(state);

    if enable_metrics {
        app = app.nest("", route_metrics(MetricsHandler));
    }

    app.layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()))
}

/// Implements `proxy::server::AdminHandler` by serving one `axum` app per accepted
/// connection with `hyper`'s HTTP/1 connection driver, rather than owning its own
/// listener: `ServerState` already runs the accept loop and restart/drain plumbing
/// (§4.6), so the admin surface only needs to turn a `TcpStream` into requests.
pub struct WebAdminHandler {
    enable_metrics: bool,
}

impl WebAdminHandler {
    pub fn new(enable_metrics: bool) -> Self {
        WebAdminHandler { enable_metrics }
    }
}

#[async_trait]
impl AdminHandler for WebAdminHandler {
    async fn handle(&self, stream: TcpStream, lifecycle: Arc<ServerLifecycle>) {
        let state = AdminState { lifecycle };
        let app = build_router(state, self.enable_metrics);
        let io = TokioIo::new(stream);
        let service = TowerToHyperService::new(app);
        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            warn!("admin connection error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok_while_running() {
        let (lifecycle, _error_rx) = ServerLifecycle::new();
        let state = AdminState { lifecycle };
        let app = build_router(state, false);
        let response = send_get(app, "/health").await;
        assert_eq!(response, http::StatusCode::OK.as_u16());
    }

    #[tokio::test]
    async fn health_reports_unavailable_once_shutting_down() {
        let (lifecycle, _error_rx) = ServerLifecycle::new();
        lifecycle.begin_shutdown("test".to_string());
        let state = AdminState { lifecycle };
        let app = build_router(state, false);
        let response = send_get(app, "/health").await;
        assert_eq!(response, http::StatusCode::SERVICE_UNAVAILABLE.as_u16());
    }

    use axum::http;
    use tower::ServiceExt;

    async fn send_get(app: Router, path: &str) -> u16 {
        let request = http::Request::builder()
            .uri(path)
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        response.status().as_u16()
    }
}
