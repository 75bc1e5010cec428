use std::time::Duration;

use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header},
    routing::{get, post},
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::CorsConfig,
    handlers::{objects, ops, uploads},
    state::AppState,
};

pub mod paths {
    pub const GENERATE_PRESIGNED_URL: &str = "/generate-presigned-url";
    pub const UPLOAD: &str = "/upload";
    pub const OBJECTS: &str = "/objects/{*key}";
    pub const OPS_PIPELINE: &str = "/ops/pipeline";
    pub const OPS_DEAD_LETTERS: &str = "/ops/dead-letters";
    pub const OPS_ACCESS: &str = "/ops/access";
}

/// Object routes accept cross-origin writes from anywhere.
const OBJECT_CORS_MAX_AGE: Duration = Duration::from_secs(3_000);

fn api_cors(cors: &CorsConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cors
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::list([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ]))
}

fn object_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(AllowMethods::list([
            Method::GET,
            Method::PUT,
            Method::POST,
            Method::DELETE,
        ]))
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("origin"),
        ]))
        .max_age(OBJECT_CORS_MAX_AGE)
}

pub fn create_app(state: AppState, cors: &CorsConfig) -> Router {
    let api = Router::new()
        .route(
            paths::GENERATE_PRESIGNED_URL,
            post(uploads::generate_presigned_url),
        )
        .route(paths::UPLOAD, post(uploads::record_upload))
        .route(paths::OPS_PIPELINE, get(ops::pipeline_status))
        .route(paths::OPS_DEAD_LETTERS, get(ops::dead_letters))
        .route(paths::OPS_ACCESS, get(ops::access_table))
        .layer(api_cors(cors));

    let objects = Router::new()
        .route(
            paths::OBJECTS,
            get(objects::get_object).put(objects::put_object),
        )
        .layer(object_cors());

    Router::new()
        .merge(api)
        .merge(objects)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
