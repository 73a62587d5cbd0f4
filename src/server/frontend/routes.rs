use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};

use crate::server::error::ServerError;
use crate::server::registry::models::RegistryConfig;
use crate::server::state::AppState;

/// Registry web UI address for a browser request such as `/my-image`
pub fn browser_redirect_location(registry: &RegistryConfig, uri: &Uri) -> String {
    let request_uri = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!(
        "https://{}/{}{}",
        registry.host, registry.repo_prefix, request_uri
    )
}

/// Send browsers to the upstream registry's UI for the same image name.
///
/// Only useful for registries that show a web page for image URLs, such as GCR.
pub async fn browser_redirect(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Response, ServerError> {
    let location = browser_redirect_location(&state.registry, &uri);
    tracing::debug!("Redirecting browser to {}", location);

    let location = HeaderValue::from_str(&location)
        .map_err(|_| ServerError::bad_request("Invalid request URI"))?;

    Ok((StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response())
}

/// Fallback when browser redirects are disabled
pub async fn not_found() -> ServerError {
    ServerError::not_found("Not found")
}
