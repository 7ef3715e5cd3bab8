use crate::badge;
use crate::models::{
    BatchGenerateRequest, BatchGenerateResponse, GenerateBadgeRequest, PreloadTemplateRequest,
};
use crate::state::AppState;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::warn;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/badge/generate", post(generate_badge))
        .route("/api/badge/batch", post(generate_batch))
        .route("/api/template/preload", post(preload_template))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/clear", post(clear_cache))
        .fallback(not_found)
        .with_state(state)
}

pub struct ApiError {
    status: StatusCode,
    error: String,
    details: Option<String>,
}

impl ApiError {
    pub fn bad_request(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
            details: None,
        }
    }

    pub fn internal(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.error });
        if let Some(details) = self.details {
            body["details"] = json!(details);
        }
        (self.status, Json(body)).into_response()
    }
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "service": "Badge PDF Generator",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": format!("{:?}", state.started_at.elapsed()),
    }))
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Not found", "path": uri.path() })),
    )
}

async fn generate_badge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<GenerateBadgeRequest>,
) -> Result<Response, ApiError> {
    if request.template.id == 0 && request.template.design.layers.is_empty() {
        return Err(ApiError::bad_request("Template is required"));
    }
    let user = &request.user.user;
    if user.id.is_empty() && user.identifier.is_empty() {
        return Err(ApiError::bad_request("User data is required"));
    }

    let pdf = badge::generate_badge(&state, &request.template, user)
        .await
        .map_err(|err| ApiError::internal("Failed to generate PDF", err.to_string()))?;

    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept == "application/json");
    if wants_json {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        return Ok(Json(json!({
            "success": true,
            "pdf_base64": BASE64.encode(&pdf),
            "filename": format!("badge_{}.pdf", user.identifier),
        }))
        .into_response());
    }

    let disposition = format!("inline; filename=badge_{}.pdf", user.identifier);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        pdf,
    )
        .into_response())
}

async fn generate_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchGenerateRequest>,
) -> Result<Json<BatchGenerateResponse>, ApiError> {
    if request.users.is_empty() {
        return Err(ApiError::bad_request("No users provided"));
    }
    if request.users.len() > state.config.max_batch_users {
        return Err(ApiError::bad_request(format!(
            "Maximum {} users per batch",
            state.config.max_batch_users
        )));
    }

    let results = badge::generate_batch(state.clone(), request.template, request.users).await;
    let success = results.iter().all(|result| result.success);
    Ok(Json(BatchGenerateResponse {
        success,
        total: results.len(),
        results,
    }))
}

/// Eagerly warm the raw asset mirror for a template's assets.
async fn preload_template(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PreloadTemplateRequest>,
) -> Json<serde_json::Value> {
    let urls: HashSet<String> = request
        .template
        .assets
        .values()
        .filter(|url| !url.is_empty())
        .cloned()
        .collect();
    let mut workers = JoinSet::new();
    for url in urls {
        let fetcher = state.fetcher.clone();
        workers.spawn(async move {
            match fetcher.fetch(&url).await {
                Ok(_) => true,
                Err(err) => {
                    warn!(url = %url, error = %err, "template asset preload failed");
                    false
                }
            }
        });
    }
    let mut cached = 0usize;
    while let Some(joined) = workers.join_next().await {
        if matches!(joined, Ok(true)) {
            cached += 1;
        }
    }
    Json(json!({ "success": true, "cached_assets": cached }))
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "memory_items": state.cache.len(),
        "cache_dir": state.disk.dir().display().to_string(),
    }))
}

async fn clear_cache(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    state.cache.clear();
    state
        .disk
        .clear()
        .await
        .map_err(|err| ApiError::internal("Failed to clear cache", err.to_string()))?;
    Ok(Json(json!({ "success": true, "message": "Cache cleared" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_app(dir: &std::path::Path) -> (Router, Arc<AppState>) {
        let state = Arc::new(AppState::new(Config::for_tests(dir.to_path_buf())).unwrap());
        (router(state.clone()), state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn shape_template() -> serde_json::Value {
        json!({
            "id": 1,
            "design": {
                "settings": {"paperWidth": 90, "paperHeight": 120, "dpi": 300},
                "layers": [{
                    "id": "box",
                    "type": "shape",
                    "position": {"x": 5, "y": 5},
                    "size": {"width": 40, "height": 20},
                    "style": {"backgroundColor": "#2244AA"},
                    "zIndex": 1,
                    "visible": true
                }]
            },
            "assets": {}
        })
    }

    #[tokio::test]
    async fn health_and_root_respond() {
        let dir = tempdir().unwrap();
        let (app, _state) = test_app(dir.path());
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let dir = tempdir().unwrap();
        let (app, _state) = test_app(dir.path());
        let response = app
            .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Not found");
        assert_eq!(body["path"], "/api/nope");
    }

    #[tokio::test]
    async fn generate_validates_template_and_user() {
        let dir = tempdir().unwrap();
        let (app, _state) = test_app(dir.path());

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/badge/generate",
                &json!({"template": {}, "user": {"user": {"id": "u"}}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Template is required");

        let response = app
            .oneshot(post_json(
                "/api/badge/generate",
                &json!({"template": shape_template(), "user": {"user": {}}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "User data is required");
    }

    #[tokio::test]
    async fn generate_returns_binary_pdf_by_default() {
        let dir = tempdir().unwrap();
        let (app, _state) = test_app(dir.path());
        let response = app
            .oneshot(post_json(
                "/api/badge/generate",
                &json!({
                    "template": shape_template(),
                    "user": {"user": {"id": "u-1", "identifier": "1001"}}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/pdf"
        );
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "inline; filename=badge_1001.pdf"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
    }

    #[tokio::test]
    async fn generate_honors_json_accept_header() {
        let dir = tempdir().unwrap();
        let (app, _state) = test_app(dir.path());
        let body = json!({
            "template": shape_template(),
            "user": {"user": {"id": "u-1", "identifier": "1001"}}
        });
        let request = Request::builder()
            .method("POST")
            .uri("/api/badge/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["filename"], "badge_1001.pdf");
        assert!(body["pdf_base64"].as_str().unwrap().len() > 100);
    }

    #[tokio::test]
    async fn batch_validates_user_count() {
        let dir = tempdir().unwrap();
        let (app, _state) = test_app(dir.path());

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/badge/batch",
                &json!({"template": shape_template(), "users": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let too_many: Vec<serde_json::Value> =
            (0..501).map(|i| json!({"user": {"id": i.to_string()}})).collect();
        let response = app
            .oneshot(post_json(
                "/api/badge/batch",
                &json!({"template": shape_template(), "users": too_many}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn batch_renders_every_user() {
        let dir = tempdir().unwrap();
        let (app, _state) = test_app(dir.path());
        let response = app
            .oneshot(post_json(
                "/api/badge/batch",
                &json!({
                    "template": shape_template(),
                    "users": [
                        {"user": {"id": "u-1", "identifier": "1001"}},
                        {"user": {"id": "u-2", "identifier": "1002"}}
                    ]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["total"], 2);
        assert_eq!(body["results"][0]["user_id"], "u-1");
        assert_eq!(body["results"][1]["identifier"], "1002");
        assert!(body["results"][1]["pdf_base64"].as_str().is_some());
    }

    #[tokio::test]
    async fn cache_stats_and_clear() {
        let dir = tempdir().unwrap();
        let (app, state) = test_app(dir.path());
        state
            .cache
            .put("k".to_string(), bytes::Bytes::from_static(b"v"));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/cache/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["memory_items"], 1);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/cache/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.cache.len(), 0);
    }

    #[tokio::test]
    async fn preload_counts_warmed_assets() {
        let dir = tempdir().unwrap();
        let (app, state) = test_app(dir.path());
        // Seed the disk mirror so the unresolvable host warms from disk.
        let url = "https://cdn.invalid.test/bg.png";
        let path = state.disk.raw_path(url);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"bytes").unwrap();

        let response = app
            .oneshot(post_json(
                "/api/template/preload",
                &json!({"template": {"id": 1, "assets": {
                    "asset_0": url,
                    "asset_1": "https://does-not-resolve.invalid/x.png"
                }}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["cached_assets"], 1);
    }
}
