use axum::{
    extract::{Extension, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use std::net::IpAddr;
use url::Url;

use super::rewrite::{rewrite_www_authenticate, upstream_url, API_VERSION_PATH};
use crate::server::error::{ServerError, ServerErrorExt};
use crate::server::middleware::{request_id_of, RequestContext};
use crate::server::proxy::{self, PROXY_USER_AGENT};
use crate::server::state::AppState;

/// Compute the upstream URL and headers for an inbound registry API request.
///
/// - The path is moved under the namespace prefix
/// - `Authorization` is replaced when `auth_header` is given, otherwise the
///   client's own value (if any) passes through
/// - A client `User-Agent` is prefixed with this proxy's product token and the custom domain
/// - `Accept` is forced to `*/*`
pub fn prepare_upstream_request(
    uri: &Uri,
    inbound: &HeaderMap,
    registry_base: &Url,
    repo_prefix: &str,
    auth_header: Option<&str>,
    original_host: &str,
    client: Option<IpAddr>,
) -> Result<(Url, HeaderMap), ServerError> {
    let url = upstream_url(uri, registry_base, repo_prefix)
        .server_err(StatusCode::BAD_REQUEST, "Cannot build upstream registry URL")?;

    let mut headers = proxy::forwarded_headers(inbound);

    if let Some(auth_header) = auth_header {
        let value = HeaderValue::from_str(auth_header)
            .internal_err("Configured authorization is not a valid header value")?;
        headers.insert(header::AUTHORIZATION, value);
    }

    if let Some(user_agent) = inbound
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    {
        let decorated = format!(
            "{} customDomain/{} {}",
            PROXY_USER_AGENT, original_host, user_agent
        );
        match HeaderValue::from_str(&decorated) {
            Ok(value) => {
                headers.insert(header::USER_AGENT, value);
            }
            Err(_) => tracing::debug!("Keeping original user agent, decorated value is invalid"),
        }
    }

    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    proxy::append_forwarded_for(&mut headers, client);

    Ok((url, headers))
}

/// Forward a registry API request to the upstream registry
pub async fn proxy_registry_request(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    request: Request,
) -> Result<Response, ServerError> {
    let (parts, body) = request.into_parts();
    let request_id = request_id_of(&parts.extensions);

    let auth_header = match &state.authenticator {
        Some(authenticator) => Some(authenticator.auth_header().await),
        None => None,
    };

    let (url, headers) = prepare_upstream_request(
        &parts.uri,
        &parts.headers,
        &state.registry_base,
        &state.registry.repo_prefix,
        auth_header.as_deref(),
        &context.original_host,
        proxy::client_ip(&parts.extensions),
    )?;

    tracing::info!(
        request_id = %request_id,
        method = %parts.method,
        upstream_url = %url,
        "Proxying registry request"
    );

    let upstream = proxy::send(&state.http_client, parts.method, url.clone(), headers, body)
        .await
        .server_err(StatusCode::BAD_GATEWAY, "Upstream registry request failed")
        .map_err(|e| {
            e.with_context("request_id", request_id.clone())
                .with_context("upstream_url", url.to_string())
        })?;

    tracing::info!(
        request_id = %request_id,
        upstream_url = %url,
        status = upstream.status().as_u16(),
        "Upstream registry responded"
    );

    Ok(proxy::into_response(upstream, |headers| {
        rewrite_www_authenticate(headers, &context.original_host)
    }))
}

/// `/v2` without the trailing slash: redirect to the API root
pub async fn redirect_to_api_root(uri: Uri) -> Result<Response, ServerError> {
    let location = match uri.query() {
        Some(query) => format!("{}?{}", API_VERSION_PATH, query),
        None => API_VERSION_PATH.to_string(),
    };

    let location = HeaderValue::from_str(&location)
        .map_err(|_| ServerError::bad_request("Invalid request URI"))?;

    Ok((StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response())
}
