use crate::api;
use crate::broker::Broker;
use crate::inventory::Inventory;
use crate::middleware::{auth_middleware, AuthConfig};
use crate::progress::PlanProgress;
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        DefaultBodyLimit, Path, Request, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{get, put},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use loadfleet_core::{LoadfleetError, LoadfleetResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Upper bound on a trigger upload.
pub const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Upper bound on a request body forwarded to an engine.
const MAX_PROXY_BODY_BYTES: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: [&str; 6] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "upgrade",
];

/// Shared application state.
pub struct AppState {
    /// Collection topics engines subscribe to.
    pub broker: Arc<Broker>,
    /// Ready engine endpoints.
    pub inventory: Arc<Inventory>,
    /// Running flags of triggered plans.
    pub progress: Arc<PlanProgress>,
    /// Root of the served plan files.
    pub files_root: PathBuf,
    proxy: reqwest::Client,
}

impl AppState {
    /// State shared by every handler.
    pub fn new(
        broker: Arc<Broker>,
        inventory: Arc<Inventory>,
        progress: Arc<PlanProgress>,
        files_root: impl Into<PathBuf>,
    ) -> LoadfleetResult<Self> {
        let proxy = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(3600))
            .pool_max_idle_per_host(100)
            .build()
            .map_err(|e| LoadfleetError::Http(format!("Failed to build proxy client: {e}")))?;
        Ok(Self {
            broker,
            inventory,
            progress,
            files_root: files_root.into(),
            proxy,
        })
    }
}

/// The coordinator's HTTP surface.
pub struct CoordinatorServer;

impl CoordinatorServer {
    /// Build the router. Everything except `/health` requires the bearer key when one is set.
    pub fn build(state: Arc<AppState>, auth: AuthConfig) -> Router {
        let files = ServeDir::new(&state.files_root);

        let protected = Router::new()
            .route(
                "/api/collections/{collection_id}",
                get(api::collection_health)
                    .post(api::trigger_collection)
                    .delete(api::term_collection),
            )
            .route(
                "/api/collections/{collection_id}/{plan_id}",
                get(api::plan_progress).delete(api::term_plan),
            )
            .route(
                "/api/collections/{collection_id}/{plan_id}/{engine_id}",
                put(api::engine_report),
            )
            .route("/pubsub/{topic}", get(ws_handler))
            .nest_service("/files", files)
            .fallback(stream_proxy)
            .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
            .layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware));

        Router::new()
            .route("/health", get(health_handler))
            .merge(protected)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

async fn health_handler() -> impl IntoResponse {
    serde_json::json!({"status": "ok", "service": "loadfleet-coordinator"}).to_string()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(topic): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, topic))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, topic: String) {
    let mut subscription = state.broker.subscribe(&topic).await;
    let subscriber_id = subscription.id;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    info!(topic = %topic, subscriber_id = %subscriber_id, "WebSocket connected");

    // Task: forward broadcasts to the engine
    let send_task = tokio::spawn(async move {
        while let Some(msg) = subscription.rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Task: drain the socket until the engine goes away
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.broker.unsubscribe(&topic, subscriber_id).await;
    info!(topic = %topic, subscriber_id = %subscriber_id, "WebSocket disconnected");
}

/// `/{engine-key}/stream[/...]` forwarded to `http://<engine addr>/stream[/...]`.
async fn stream_proxy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let path = request.uri().path().trim_start_matches('/').to_string();
    let (key, rest) = path.split_once('/').unwrap_or((path.as_str(), ""));
    if key.is_empty() || !(rest == "stream" || rest.starts_with("stream/")) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(addr) = state.inventory.find_address(key) else {
        warn!(engine = key, "No address for engine");
        return (StatusCode::BAD_GATEWAY, format!("unknown engine {key}")).into_response();
    };
    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let url = format!("http://{addr}/{rest}{query}");

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_PROXY_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let mut upstream = state.proxy.request(parts.method, &url).body(body);
    for (name, value) in &parts.headers {
        if name != header::HOST && !HOP_BY_HOP.contains(&name.as_str()) {
            upstream = upstream.header(name, value);
        }
    }

    match upstream.send().await {
        Ok(resp) => {
            let mut builder = Response::builder().status(resp.status());
            for (name, value) in resp.headers() {
                if !HOP_BY_HOP.contains(&name.as_str()) {
                    builder = builder.header(name, value);
                }
            }
            builder
                .body(Body::from_stream(resp.bytes_stream()))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(e) => {
            warn!(engine = key, url = %url, error = %e, "Engine stream proxy failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::inventory::FileEndpointSource;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn app(files_root: &std::path::Path) -> Router {
        let source = Arc::new(FileEndpointSource::new(files_root.join("endpoints.json")));
        let state = AppState::new(
            Broker::new(),
            Arc::new(Inventory::new(source)),
            Arc::new(PlanProgress::new()),
            files_root,
        )
        .unwrap();
        CoordinatorServer::build(Arc::new(state), AuthConfig::new("k"))
    }

    async fn status(app: Router, uri: &str, key: Option<&str>) -> StatusCode {
        let mut req = HttpRequest::builder().uri(uri);
        if let Some(key) = key {
            req = req.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        app.oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(status(app(tmp.path()), "/health", None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_routes_need_key() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        assert_eq!(
            status(app.clone(), "/api/collections/1?engines=1", None).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(app.clone(), "/files/x.csv", Some("wrong")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(app, "/engine-1/stream", None).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_files_are_served() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("collection/1")).unwrap();
        std::fs::write(tmp.path().join("collection/1/a.csv"), "x").unwrap();
        let app = app(tmp.path());
        assert_eq!(
            status(app.clone(), "/files/collection/1/a.csv", Some("k")).await,
            StatusCode::OK
        );
        assert_eq!(
            status(app, "/files/collection/1/b.csv", Some("k")).await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_fallback_routing() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        assert_eq!(
            status(app.clone(), "/unknown-engine/stream", Some("k")).await,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(app.clone(), "/unknown-engine/metrics", Some("k")).await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(status(app, "/", Some("k")).await, StatusCode::NOT_FOUND);
    }
}
