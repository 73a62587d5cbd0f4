use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::Response,
};

use super::token_request_url;
use crate::server::error::{ServerError, ServerErrorExt};
use crate::server::middleware::request_id_of;
use crate::server::proxy;
use crate::server::state::AppState;

/// Forward a token exchange to the upstream token endpoint.
///
/// The client's own credentials are what the token endpoint checks, so the
/// configured authenticator is not applied here.
pub async fn proxy_token_request(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ServerError> {
    let (parts, body) = request.into_parts();
    let request_id = request_id_of(&parts.extensions);

    let url = token_request_url(
        &state.token_endpoint,
        parts.uri.query(),
        &state.registry.repo_prefix,
    );

    let mut headers = proxy::forwarded_headers(&parts.headers);
    proxy::append_forwarded_for(&mut headers, proxy::client_ip(&parts.extensions));

    tracing::info!(
        request_id = %request_id,
        method = %parts.method,
        token_url = %url,
        "Proxying token request"
    );

    let upstream = proxy::send(&state.http_client, parts.method, url.clone(), headers, body)
        .await
        .server_err(StatusCode::BAD_GATEWAY, "Token endpoint request failed")
        .map_err(|e| {
            e.with_context("request_id", request_id.clone())
                .with_context("token_url", url.to_string())
        })?;

    tracing::info!(
        request_id = %request_id,
        status = upstream.status().as_u16(),
        "Token endpoint responded"
    );

    Ok(proxy::into_response(upstream, |_| {}))
}
