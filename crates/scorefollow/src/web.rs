//! HTTP and WebSocket endpoints of the device service.

use crate::devices::{self, DeviceInfo};
use crate::session::{run_alignment_session, SessionContext};
use crate::transport::split_websocket;
use crate::tuner::{run_tuner_session, TunerContext};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::HeaderValue,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use followconf::CorsConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

/// Shared state for web handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionContext>,
    pub tuner: Arc<TunerContext>,
    active: Arc<AtomicUsize>,
    start_time: Instant,
}

impl AppState {
    pub fn new(sessions: SessionContext, tuner: TunerContext) -> Self {
        Self {
            sessions: Arc::new(sessions),
            tuner: Arc::new(tuner),
            active: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Connections currently running a session.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Counts a connection as active until dropped.
struct ActiveSession(Arc<AtomicUsize>);

impl ActiveSession {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn router(state: AppState, cors: &CorsConfig) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/local/", get(hello_local))
        .route("/health", get(health))
        .route("/local/audio-devices", get(audio_devices))
        .route("/local/midi-devices", get(midi_devices))
        .route("/local/ws", get(alignment_ws))
        .route("/local/ws/tuner/violin", get(tuner_ws))
        .layer(cors_layer(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(cors: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if cors.allows_any() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = cors
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn hello() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "Hello World" }))
}

async fn hello_local() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "Hello local" }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": {
            "active": state.active_sessions(),
            "positions": state.sessions.store.len(),
        }
    }))
}

async fn audio_devices() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "devices": enumerate(devices::list_audio_inputs).await }))
}

async fn midi_devices() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "devices": enumerate(devices::list_midi_inputs).await }))
}

/// Device enumeration talks to the OS audio/MIDI stacks, so it runs off the runtime.
async fn enumerate(list: fn() -> Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    tokio::task::spawn_blocking(list).await.unwrap_or_else(|e| {
        error!("device enumeration panicked: {}", e);
        Vec::new()
    })
}

async fn alignment_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let _active = ActiveSession::enter(&state.active);
        let (source, sink) = split_websocket(socket);
        let report = run_alignment_session(&state.sessions, source, sink).await;
        debug!(status = %report.status(), "score-following connection finished");
    })
}

async fn tuner_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let _active = ActiveSession::enter(&state.active);
        let (source, sink) = split_websocket(socket);
        let report = run_tuner_session(&state.tuner, source, sink).await;
        debug!(status = %report.status(), "tuner connection finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DefaultEngineFactory;
    use crate::files::CloudFileProvider;
    use crate::position::PositionStore;
    use crate::tuner::CpalCaptureOpener;
    use crate::worker::AlignmentPool;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use followconf::{SessionConfig, TunerConfig};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let sessions = SessionContext {
            store: PositionStore::new_shared(),
            pool: Arc::new(AlignmentPool::start(Arc::new(DefaultEngineFactory)).unwrap()),
            files: Arc::new(CloudFileProvider::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap()),
            config: SessionConfig::default(),
            work_root: std::env::temp_dir().join("scorefollow-web-tests"),
        };
        let tuner = TunerContext {
            opener: Arc::new(CpalCaptureOpener),
            config: TunerConfig::default(),
        };
        AppState::new(sessions, tuner)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_hello_routes() {
        let app = router(test_state(), &CorsConfig::default());
        let (status, body) = get_json(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Hello World");

        let (_, body) = get_json(app, "/local/").await;
        assert_eq!(body["message"], "Hello local");
    }

    #[tokio::test]
    async fn test_health_reports_sessions() {
        let state = test_state();
        let _active = ActiveSession::enter(&state.active);
        let app = router(state.clone(), &CorsConfig::default());

        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"]["active"], 1);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_active_session_guard() {
        let state = test_state();
        {
            let _a = ActiveSession::enter(&state.active);
            let _b = ActiveSession::enter(&state.active);
            assert_eq!(state.active_sessions(), 2);
        }
        assert_eq!(state.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let app = router(test_state(), &CorsConfig::default());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/local/")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_cors_origin_list() {
        let cors = CorsConfig {
            allowed_origins: vec!["http://app.local".to_string()],
        };
        let app = router(test_state(), &cors);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/local/")
                    .header("origin", "http://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.headers().get("access-control-allow-origin").is_none());
    }
}
