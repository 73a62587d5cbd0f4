use super::handlers;
use crate::server::state::AppState;
use axum::{routing::any, Router};

pub fn routes() -> Router<AppState> {
    Router::new().route("/_token", any(handlers::proxy_token_request))
}
