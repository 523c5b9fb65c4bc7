use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, patch, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod access;
pub mod annotations;
pub mod config;
pub mod error;
pub mod export;
pub mod handlers;
pub mod materializer;
pub mod materials;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod units;

use config::AppConfig;
use pipeline::PipelineHandle;
use store::AnnotationStore;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AnnotationStore>,
    pub pipeline: PipelineHandle,
}

pub fn create_app(state: AppState, config: &AppConfig) -> Router {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let methods = [Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE];
    let headers = [header::CONTENT_TYPE, HeaderName::from_static(handlers::REQUESTER_HEADER)];

    let cors = if origins.is_empty() {
        // Fallback to Any only if no valid origins configured
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers)
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
    };

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/users", post(handlers::create_user))
        .route("/materials", post(handlers::create_material))
        .route("/blueprint-images", post(handlers::register_image))
        .route(
            "/blueprint-images/:id",
            get(handlers::get_image).delete(handlers::delete_image),
        )
        .route("/blueprint-images/:id/annotate", post(handlers::trigger_annotation))
        .route("/blueprint-images/:id/calibration", put(handlers::update_calibration))
        .route("/blueprint-images/:id/verify", post(handlers::verify_image))
        .route("/blueprint-images/:id/annotations", get(handlers::list_annotations))
        .route("/blueprint-images/:id/exports/:kind", get(handlers::get_export))
        .route("/annotations/:kind", post(handlers::create_annotation))
        .route(
            "/annotations/:kind/:id",
            patch(handlers::update_annotation).delete(handlers::delete_annotation),
        )
        .route(
            "/annotations/:kind/:id/materials",
            get(handlers::list_materials).post(handlers::link_materials),
        )
        .route(
            "/annotations/:kind/:id/materials/:material_id",
            patch(handlers::update_material_link).delete(handlers::unlink_material),
        )
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
