//! Request and response rewriting between the custom domain and the upstream registry.
//!
//! Inbound `/v2/<name>/...` paths are moved under the configured namespace
//! prefix, and `WWW-Authenticate` challenges coming back are pointed at this
//! proxy's own `/_token` endpoint.

use axum::http::{header, HeaderMap, HeaderValue, Uri};
use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;
use url::Url;

/// Registry v2 API version check, forwarded verbatim
pub const API_VERSION_PATH: &str = "/v2/";

lazy_static! {
    static ref REALM: Regex = Regex::new(r#"realm="(.*?)""#).unwrap();
}

/// Move a `/v2/...` path under `repo_prefix`.
///
/// `/v2/` itself is returned unchanged, as is any path that does not start with `/v2/`.
pub fn rewrite_registry_path<'a>(path: &'a str, repo_prefix: &str) -> Cow<'a, str> {
    if path == API_VERSION_PATH {
        return Cow::Borrowed(path);
    }

    match path.strip_prefix(API_VERSION_PATH) {
        Some(rest) => Cow::Owned(format!("{}{}/{}", API_VERSION_PATH, repo_prefix, rest)),
        None => Cow::Borrowed(path),
    }
}

/// `https://<host>`, the base every upstream registry request is resolved against
pub fn registry_base_url(host: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("https://{}", host))
}

/// Build the upstream URL for an inbound registry API request.
///
/// The rewritten path is appended to `registry_base` and the raw query string
/// is carried over untouched.
pub fn upstream_url(
    uri: &Uri,
    registry_base: &Url,
    repo_prefix: &str,
) -> Result<Url, url::ParseError> {
    let path = rewrite_registry_path(uri.path(), repo_prefix);

    let mut raw = format!("{}{}", registry_base.as_str().trim_end_matches('/'), path);
    if let Some(query) = uri.query() {
        raw.push('?');
        raw.push_str(query);
    }

    Url::parse(&raw)
}

/// Extract the `realm` parameter from a `WWW-Authenticate` challenge
pub fn realm_from_challenge(challenge: &str) -> Option<&str> {
    REALM
        .captures(challenge)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Token endpoint URL of this proxy as seen by a client that connected to `original_host`
pub fn proxy_token_realm(original_host: &str) -> String {
    format!("https://{}/_token", original_host)
}

/// Point every `realm="..."` in a challenge at this proxy's token endpoint.
///
/// Returns `None` when the challenge has no realm parameter.
pub fn rewrite_realm(challenge: &str, original_host: &str) -> Option<String> {
    if !REALM.is_match(challenge) {
        return None;
    }

    let replacement = format!(r#"realm="{}""#, proxy_token_realm(original_host));
    Some(
        REALM
            .replace_all(challenge, regex::NoExpand(&replacement))
            .into_owned(),
    )
}

/// Rewrite all `WWW-Authenticate` headers of an upstream response in place.
///
/// Values that are not text or carry no realm are kept as they are.
pub fn rewrite_www_authenticate(headers: &mut HeaderMap, original_host: &str) {
    if !headers.contains_key(header::WWW_AUTHENTICATE) {
        return;
    }

    let rewritten: Vec<HeaderValue> = headers
        .get_all(header::WWW_AUTHENTICATE)
        .iter()
        .map(|value| {
            let Ok(challenge) = value.to_str() else {
                tracing::debug!("Leaving non-text www-authenticate header untouched");
                return value.clone();
            };

            match rewrite_realm(challenge, original_host) {
                Some(updated) => HeaderValue::from_str(&updated).unwrap_or_else(|e| {
                    tracing::debug!(
                        error = %e,
                        original_host = %original_host,
                        "Rewritten www-authenticate header is not a valid header value"
                    );
                    value.clone()
                }),
                None => {
                    tracing::debug!(
                        challenge = %challenge,
                        "No realm found in www-authenticate header, passing through"
                    );
                    value.clone()
                }
            }
        })
        .collect();

    headers.remove(header::WWW_AUTHENTICATE);
    for value in rewritten {
        headers.append(header::WWW_AUTHENTICATE, value);
    }
}
