//! Admin HTTP API
//!
//! Health, bus mode overview, decoded module settings, runtime log level,
//! forward table maintenance and the network block switch.

#![allow(clippy::disallowed_methods)] // json! macro used in multiple functions

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use errors::{HubError, HubErrorTrait};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bus::ModeManager;
use crate::forward::ForwardTable;
use crate::mirror::ModuleState;

/// Shared state of the admin routes
#[derive(Debug, Clone)]
pub struct AdminState {
    pub manager: Arc<ModeManager>,
    pub forward: Arc<ForwardTable>,
}

/// [`HubError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.0.into_http_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct LogLevelResponse {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetLogLevelRequest {
    pub level: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForwardEntry {
    pub router: u8,
    pub address: Ipv4Addr,
}

#[derive(Debug, Deserialize)]
pub struct ForwardAddress {
    pub address: Ipv4Addr,
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub blocked: bool,
}

pub fn create_routes(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(bus_status))
        .route("/api/modules/{module}/settings", get(module_settings))
        .route("/api/log-level", get(get_log_level).put(set_log_level))
        .route("/api/forward", get(list_forward).post(add_forward))
        .route(
            "/api/forward/{router}",
            put(set_forward).delete(delete_forward),
        )
        .route("/api/block", put(set_block))
        .layer(axum::middleware::from_fn(common::logging::http_request_logger))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// @route GET /health
async fn health_check(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "hubsrv",
        "mode": state.manager.mode().to_string(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// @route GET /api/status
async fn bus_status(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let sinks = state.manager.sinks();
    Json(json!({
        "bus": state.manager.status().await,
        "router": sinks.router.snapshot(),
        "modules": sinks.registry.overview(),
    }))
}

/// @route GET /api/modules/{module}/settings
async fn module_settings(
    State(state): State<AdminState>,
    Path(module): Path<u8>,
) -> ApiResult<Json<ModuleState>> {
    Ok(Json(state.manager.sinks().registry.state(module)?))
}

/// @route GET /api/log-level
async fn get_log_level() -> Json<LogLevelResponse> {
    Json(LogLevelResponse {
        level: common::logging::get_log_level(),
        status: None,
        error: None,
    })
}

/// @route PUT /api/log-level
async fn set_log_level(
    Json(req): Json<SetLogLevelRequest>,
) -> (StatusCode, Json<LogLevelResponse>) {
    match common::logging::set_log_level(&req.level) {
        Ok(()) => (
            StatusCode::OK,
            Json(LogLevelResponse {
                level: req.level,
                status: Some("updated".to_string()),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(LogLevelResponse {
                level: common::logging::get_log_level(),
                status: None,
                error: Some(e),
            }),
        ),
    }
}

/// @route GET /api/forward
async fn list_forward(State(state): State<AdminState>) -> Json<BTreeMap<u8, Ipv4Addr>> {
    Json(state.forward.entries())
}

/// @route POST /api/forward
async fn add_forward(
    State(state): State<AdminState>,
    Json(entry): Json<ForwardEntry>,
) -> ApiResult<(StatusCode, Json<ForwardEntry>)> {
    state.forward.add(entry.router, entry.address)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// @route PUT /api/forward/{router}
async fn set_forward(
    State(state): State<AdminState>,
    Path(router): Path<u8>,
    Json(body): Json<ForwardAddress>,
) -> ApiResult<Json<serde_json::Value>> {
    let previous = state.forward.set(router, body.address)?;
    Ok(Json(json!({
        "router": router,
        "address": body.address,
        "previous": previous,
    })))
}

/// @route DELETE /api/forward/{router}
async fn delete_forward(
    State(state): State<AdminState>,
    Path(router): Path<u8>,
) -> ApiResult<Json<ForwardEntry>> {
    let address = state.forward.delete(router)?;
    Ok(Json(ForwardEntry { router, address }))
}

/// @route PUT /api/block
/// @side-effects Blocking stops Operate mode, releasing starts it again
async fn set_block(
    State(state): State<AdminState>,
    Json(req): Json<BlockRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.blocked {
        info!("Network block requested over admin API");
        state.manager.block_network().await?;
    } else {
        info!("Network release requested over admin API");
        state.manager.unblock_network().await?;
    }
    Ok(Json(json!({ "bus": state.manager.status().await })))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::{BusLinkContext, BusMode, BusTiming, EventSinks, SerialLink};
    use crate::mirror::ModuleRegistry;
    use crate::notify::LogNotifier;
    use crate::router_status::RouterState;
    use crate::transport::{MockTransport, RouterSim};
    use axum::{body::Body, http::Request};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    async fn build_test_state() -> AdminState {
        let mock = Arc::new(MockTransport::with_responder(
            RouterSim::new().into_responder(),
        ));
        let timing = BusTiming {
            response_timeout: Duration::from_millis(200),
            settle: Duration::from_millis(1),
            mode_settle: Duration::from_millis(5),
            watcher_stop: Duration::from_millis(500),
            boot_retry_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let ctx = Arc::new(BusLinkContext::new(
            Arc::new(SerialLink::new(mock)),
            timing,
        ));
        let sinks = EventSinks {
            notifier: Arc::new(LogNotifier),
            registry: Arc::new(ModuleRegistry::new()),
            router: Arc::new(RouterState::new()),
            relay: None,
        };
        let manager = Arc::new(ModeManager::new(ctx, sinks, 1, CancellationToken::new()));
        manager.initialize().await.unwrap();
        AdminState {
            manager,
            forward: Arc::new(ForwardTable::in_memory()),
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method(method)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_ok() {
        let app = create_routes(build_test_state().await);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["mode"], "ClientServer");
    }

    #[tokio::test]
    async fn test_status_reports_mode() {
        let app = create_routes(build_test_state().await);
        let req = Request::builder()
            .uri("/api/status")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["bus"]["mode"], "ClientServer");
        assert_eq!(body["bus"]["network_blocked"], false);
    }

    #[tokio::test]
    async fn test_module_settings_lookup() {
        let state = build_test_state().await;
        let mut block = vec![0u8; crate::mirror::MIRROR_LEN];
        block[crate::mirror::MirrorIndex::MOD_ID] = 4;
        block[crate::mirror::MirrorIndex::T_SHORT] = 30;
        state.manager.sinks().registry.apply_mirror(4, &block);
        let app = create_routes(state);

        let fetch = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app
            .clone()
            .oneshot(fetch("/api/modules/4/settings"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["id"], 4);
        assert_eq!(body["t_short_ms"], 300);

        let resp = app.oneshot(fetch("/api/modules/9/settings")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_forward_crud() {
        let state = build_test_state().await;
        let app = create_routes(state.clone());

        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/forward",
                json!({"router": 2, "address": "192.168.1.20"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/forward",
                json!({"router": 2, "address": "192.168.1.21"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/forward/2",
                json!({"address": "192.168.1.22"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["previous"], "192.168.1.20");
        assert_eq!(state.forward.lookup(2), Some(Ipv4Addr::new(192, 168, 1, 22)));

        let req = Request::builder()
            .uri("/api/forward/2")
            .method("DELETE")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);

        let req = Request::builder()
            .uri("/api/forward/2")
            .method("DELETE")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_block_and_release() {
        let state = build_test_state().await;
        let app = create_routes(state.clone());
        state.manager.start_operate().await.unwrap();

        let resp = app
            .clone()
            .oneshot(json_request("PUT", "/api/block", json!({"blocked": true})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.manager.mode(), BusMode::ClientServer);
        assert!(state.manager.context().state().network_blocked);

        let resp = app
            .oneshot(json_request("PUT", "/api/block", json!({"blocked": false})))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["bus"]["mode"], "Operate");
        state.manager.stop_operate().await.unwrap();
    }

    #[tokio::test]
    async fn test_log_level_without_subscriber() {
        let app = create_routes(build_test_state().await);
        let resp = app
            .oneshot(json_request("PUT", "/api/log-level", json!({"level": "debug"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());
    }
}
