//! Forwarding plumbing shared by the registry API proxy and the token proxy.

use axum::{
    body::{Body, HttpBody},
    extract::ConnectInfo,
    http::{header, Extensions, HeaderMap, HeaderName, HeaderValue, Method},
    response::Response,
};
use reqwest::Client;
use std::net::{IpAddr, SocketAddr};
use url::Url;

/// Product token this proxy identifies itself with upstream
pub const PROXY_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Headers that only apply to a single hop and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Header names listed in a `Connection` header, which are hop-by-hop as well
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Copy end-to-end headers. `Host` is dropped so the client sets it from the target URL.
pub fn forwarded_headers(inbound: &HeaderMap) -> HeaderMap {
    let connection = connection_tokens(inbound);

    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound.iter() {
        if name == header::HOST
            || is_hop_by_hop(name)
            || connection.iter().any(|token| token == name.as_str())
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Remote address of the client, when the listener recorded it
pub fn client_ip(extensions: &Extensions) -> Option<IpAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Append the client address to `X-Forwarded-For`
pub fn append_forwarded_for(headers: &mut HeaderMap, client: Option<IpAddr>) {
    let Some(ip) = client else {
        return;
    };

    let forwarded_for = HeaderName::from_static("x-forwarded-for");
    let value = match headers.get(&forwarded_for).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, ip),
        _ => ip.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(forwarded_for, value);
    }
}

/// Send a request upstream, streaming the inbound body through.
///
/// Requests without a body (most registry reads) are sent without one so the
/// upstream never sees a chunked empty body.
pub async fn send(
    client: &Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Body,
) -> Result<reqwest::Response, reqwest::Error> {
    let request = client.request(method, url).headers(headers);

    let request = if body.is_end_stream() {
        request
    } else {
        request.body(reqwest::Body::wrap_stream(body.into_data_stream()))
    };

    request.send().await
}

/// Turn an upstream response into a streamed axum response.
///
/// `rewrite_headers` sees the end-to-end headers before they are sent to the client.
pub fn into_response(
    upstream: reqwest::Response,
    rewrite_headers: impl FnOnce(&mut HeaderMap),
) -> Response {
    let status = upstream.status();
    let mut headers = forwarded_headers(upstream.headers());
    rewrite_headers(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
