use axum::{extract::Request, http::header, middleware::Next, response::Response};
use uuid::Uuid;

/// Request ID stored in request extensions for correlation and debugging
#[derive(Clone, Debug)]
pub struct RequestId(pub Uuid);

/// Per-request values recorded before routing and read by the proxy handlers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Host the client used to reach this proxy (the custom domain)
    pub original_host: String,
}

/// Middleware that generates and injects a unique request ID for each request.
///
/// The request ID is:
/// - Generated as a UUID v4
/// - Stored in request extensions for use by handlers
/// - Added to response headers as `x-request-id` for client-side debugging
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());

    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;

    response.headers_mut().insert(
        header::HeaderName::from_static("x-request-id"),
        header::HeaderValue::from_str(&request_id.0.to_string())
            .unwrap_or_else(|_| header::HeaderValue::from_static("invalid")),
    );

    response
}

/// Middleware that records the inbound host as a [`RequestContext`].
///
/// Handlers extract it with `Extension<RequestContext>` and pass it on to the
/// rewriting functions, which need to know what "self" means for this request.
pub async fn capture_host_middleware(mut request: Request, next: Next) -> Response {
    let context = RequestContext {
        original_host: original_host(&request),
    };
    request.extensions_mut().insert(context);

    next.run(request).await
}

/// `Host` header, or the URI authority for HTTP/2 requests
fn original_host(request: &Request) -> String {
    request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Request ID formatted for log fields, empty when the middleware did not run
pub fn request_id_of(extensions: &axum::http::Extensions) -> String {
    extensions
        .get::<RequestId>()
        .map(|rid| rid.0.to_string())
        .unwrap_or_default()
}
