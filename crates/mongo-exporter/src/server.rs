//! HTTP exposition: `/metrics`, `/health` and an index page.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use mongo_exporter_core::CollectorManager;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

/// How long in-flight connections get to finish after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<CollectorManager>,
    pub registry: Arc<Registry>,
    pub ping_timeout: Duration,
}

pub type SharedState = State<AppState>;

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .route("/", get(handle_index))
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(request_timeout))
}

/// Per-connection limits applied by the HTTP codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Time a client has to send a complete request head. On HTTP/1 the
    /// timer also runs while a kept-alive connection waits for its next
    /// request.
    pub header_read_timeout: Duration,
    /// HTTP/2 connections are pinged at this interval and dropped when a
    /// ping goes unanswered for `header_read_timeout`.
    pub keep_alive_interval: Duration,
}

pub fn connection_builder(limits: ConnectionLimits) -> ConnBuilder<TokioExecutor> {
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .keep_alive(true)
        .header_read_timeout(limits.header_read_timeout);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(Some(limits.keep_alive_interval))
        .keep_alive_timeout(limits.header_read_timeout);
    builder
}

/// Accepts connections until `shutdown` resolves, then waits up to
/// [`SHUTDOWN_GRACE`] for open connections to drain.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    limits: ConnectionLimits,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let builder = Arc::new(connection_builder(limits));
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown);

    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            () = &mut shutdown => break,
        };

        let builder = Arc::clone(&builder);
        let watcher = graceful.watcher();
        let service = TowerToHyperService::new(ScrapeLog::new(app.clone(), peer));
        tokio::spawn(async move {
            let conn = builder.serve_connection(TokioIo::new(socket), service);
            if let Err(e) = watcher.watch(conn).await {
                debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }

    drop(listener);
    tokio::select! {
        () = graceful.shutdown() => debug!("all connections drained"),
        () = tokio::time::sleep(SHUTDOWN_GRACE) => {
            warn!(grace = ?SHUTDOWN_GRACE, "connections still open after grace period");
        }
    }
    Ok(())
}

/// Runs one collection cycle on the blocking pool and encodes it.
async fn handle_metrics(State(state): SharedState) -> Response {
    let registry = Arc::clone(&state.registry);
    let encoded = tokio::task::spawn_blocking(move || {
        let families = registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf).map(|_| buf)
    })
    .await;

    match encoded {
        Ok(Ok(body)) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
        Err(e) => {
            error!(error = %e, "metrics collection panicked in spawn_blocking");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics collection failed").into_response()
        }
    }
}

async fn handle_health(State(state): SharedState) -> Response {
    let manager = Arc::clone(&state.manager);
    let timeout = state.ping_timeout;
    let result = tokio::task::spawn_blocking(move || manager.ping(timeout)).await;

    match result {
        Ok(Ok(())) => (
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"status":"healthy"}"#,
        )
            .into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "Health check failed").into_response()
        }
        Err(e) => {
            error!(error = %e, "health check panicked in spawn_blocking");
            (StatusCode::SERVICE_UNAVAILABLE, "Health check failed").into_response()
        }
    }
}

async fn handle_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>MongoDB Exporter</title>
    <style>
        body { font-family: sans-serif; margin: 40px; }
        .section { background: #f5f5f5; padding: 10px; margin: 10px 0; border-radius: 5px; }
    </style>
</head>
<body>
    <h1>MongoDB Exporter</h1>
    <div class="section">
        <p><a href="/metrics">/metrics</a> - Prometheus metrics</p>
        <p><a href="/health">/health</a> - upstream health check</p>
    </div>
    <div class="section">
        <pre>scrape_configs:
  - job_name: 'mongodb'
    static_configs:
      - targets: ['localhost:8080']</pre>
    </div>
</body>
</html>
"#;

// ============================================================
// Request log
// ============================================================

/// Scrapes and health probes arrive every few seconds, so they log at debug;
/// other paths log at info and server errors at warn.
fn is_probe(path: &str) -> bool {
    matches!(path, "/metrics" | "/health")
}

/// Logs each request served on one connection, tagged with its peer.
#[derive(Clone)]
pub struct ScrapeLog<S> {
    inner: S,
    peer: SocketAddr,
}

impl<S> ScrapeLog<S> {
    pub fn new(inner: S, peer: SocketAddr) -> Self {
        Self { inner, peer }
    }
}

impl<S, B> tower::Service<Request<B>> for ScrapeLog<S>
where
    S: tower::Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let path = req.uri().path().to_owned();
        let peer = self.peer;
        let started = Instant::now();
        let ready = self.inner.clone();
        let fut = std::mem::replace(&mut self.inner, ready).call(req);

        Box::pin(async move {
            let response = fut.await?;
            let status = response.status();
            let elapsed = started.elapsed();
            if status.is_server_error() {
                warn!(%peer, path = %path, status = status.as_u16(), ?elapsed, "request failed");
            } else if is_probe(&path) {
                debug!(%peer, path = %path, status = status.as_u16(), ?elapsed, "served");
            } else {
                info!(%peer, path = %path, status = status.as_u16(), ?elapsed, "served");
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use mongo_exporter_core::client::{ClientError, DiagnosticClient};
    use mongo_exporter_core::config::CollectorConfig;
    use mongo_exporter_core::mock::MockClient;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    fn app(mock: MockClient) -> (Router, Arc<CollectorManager>) {
        let client: Arc<dyn DiagnosticClient> = Arc::new(mock);
        let manager = Arc::new(CollectorManager::new(client, CollectorConfig::default()));
        manager.initialize().unwrap();
        let registry = Registry::new();
        registry.register(Box::new(manager.bridge())).unwrap();
        let state = AppState {
            manager: Arc::clone(&manager),
            registry: Arc::new(registry),
            ping_timeout: Duration::from_secs(1),
        };
        (router(state, Duration::from_secs(30)), manager)
    }

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(axum::http::Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _) = app(MockClient::standalone());
        let (status, body) = get_path(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("# TYPE mongodb_instance_uptime_seconds gauge"));
        assert!(body.contains(r#"instance="db1:27017""#));
    }

    #[tokio::test]
    async fn test_metrics_after_shutdown_is_empty() {
        let (app, manager) = app(MockClient::standalone());
        manager.shutdown();
        let (status, body) = get_path(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_health_ok() {
        let (app, _) = app(MockClient::standalone());
        let (status, body) = get_path(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"healthy"}"#);
    }

    #[tokio::test]
    async fn test_health_unavailable() {
        let mut mock = MockClient::standalone();
        mock.fail_ping(ClientError::Connection("server selection timeout".into()));
        let (app, _) = app(mock);
        let (status, _) = get_path(app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    fn limits(header_read_timeout: Duration) -> ConnectionLimits {
        ConnectionLimits {
            header_read_timeout,
            keep_alive_interval: Duration::from_secs(60),
        }
    }

    async fn spawn_server(
        app: Router,
        limits: ConnectionLimits,
    ) -> (
        SocketAddr,
        tokio::sync::oneshot::Sender<()>,
        tokio::task::JoinHandle<std::io::Result<()>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(serve(listener, app, limits, async move {
            let _ = rx.await;
        }));
        (addr, tx, handle)
    }

    #[tokio::test]
    async fn test_serve_health_then_shutdown() {
        let (app, _) = app(MockClient::standalone());
        let (addr, tx, handle) = spawn_server(app, limits(Duration::from_secs(5))).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        let reply = String::from_utf8(reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.ends_with(r#"{"status":"healthy"}"#));

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_slow_request_head_is_dropped() {
        let (app, _) = app(MockClient::standalone());
        let (addr, _tx, _handle) = spawn_server(app, limits(Duration::from_millis(200))).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /metrics HTTP/1.1\r\n").await.unwrap();
        let mut reply = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply)).await;
        assert!(closed.is_ok(), "connection still open after the header read timeout");
        assert!(!String::from_utf8_lossy(&reply).contains("200 OK"));
    }

    #[tokio::test]
    async fn test_scrape_log_passes_response_through() {
        let (app, _) = app(MockClient::standalone());
        let peer: SocketAddr = "10.1.2.3:40000".parse().unwrap();
        let response = ScrapeLog::new(app, peer)
            .oneshot(axum::http::Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_probe_paths() {
        assert!(is_probe("/metrics"));
        assert!(is_probe("/health"));
        assert!(!is_probe("/"));
        assert!(!is_probe("/metrics/extra"));
    }

    #[tokio::test]
    async fn test_index_and_not_found() {
        let (app, _) = app(MockClient::standalone());
        let (status, body) = get_path(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("/metrics"));

        let (status, _) = get_path(app, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
