mod assets;
mod badge;
mod cache;
mod config;
mod flex;
mod fonts;
mod http;
mod models;
mod placeholder;
mod preload;
mod qr;
mod raster;
mod render;
mod state;

use crate::config::Config;
use crate::state::AppState;
use axum::body::HttpBody;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, Response};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::{
    predicate::{DefaultPredicate, Predicate},
    CompressionLayer,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::info;

/// PDF bodies and embedded images are already dense; compressing them wastes
/// CPU on every badge download.
#[derive(Clone)]
struct NoPdfCompression {
    inner: DefaultPredicate,
}

impl NoPdfCompression {
    fn new() -> Self {
        Self {
            inner: DefaultPredicate::new(),
        }
    }
}

impl Predicate for NoPdfCompression {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: HttpBody,
    {
        if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
            if let Ok(content_type) = content_type.to_str() {
                if content_type.starts_with("application/pdf")
                    || content_type.starts_with("image/")
                {
                    return false;
                }
            }
        }
        self.inner.should_compress(response)
    }
}

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = if state.config.max_in_flight_requests == 0 {
        usize::MAX
    } else {
        state.config.max_in_flight_requests
    };
    let max_body_bytes = state.config.max_body_bytes;
    http::router(state)
        .layer(CompressionLayer::new().compress_when(NoPdfCompression::new()))
        .layer(
            TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    info!(
        port = config.port,
        cache_dir = %config.cache_dir.display(),
        font_size_unit = ?config.font_size_unit,
        max_concurrent_preloads = config.max_concurrent_preloads,
        max_concurrent_renders = config.max_concurrent_renders,
        "startup config summary"
    );
    let state = Arc::new(AppState::new(config)?);

    let evict_interval = state.config.cache_evict_interval;
    if !evict_interval.is_zero() {
        let memory = state.cache.clone();
        let disk = state.disk.clone();
        tokio::spawn(async move {
            cache::evict_loop(memory, disk, evict_interval).await;
        });
    }

    let app = build_app(state.clone());
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "badge renderer listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::tempdir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn app_serves_health_through_middleware() {
        let dir = tempdir().unwrap();
        let state = Arc::new(AppState::new(Config::for_tests(dir.path().to_path_buf())).unwrap());
        let app = build_app(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
