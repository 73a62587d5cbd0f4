use super::handlers;
use crate::server::state::AppState;
use axum::{
    routing::{any, get},
    Router,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v2", get(handlers::redirect_to_api_root))
        .route("/v2/", any(handlers::proxy_registry_request))
        .route("/v2/{*path}", any(handlers::proxy_registry_request))
}
