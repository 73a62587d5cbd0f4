//! Token exchange proxy.
//!
//! Clients follow the rewritten `WWW-Authenticate` realm to `/_token`. The
//! requested scopes name repositories as the client sees them, so the
//! namespace prefix is injected before the request goes to the registry's
//! real token endpoint.

pub mod handlers;
pub mod routes;

use url::{form_urlencoded, Url};

const REPOSITORY_SCOPE: &str = "repository:";

/// Put the first `repository:` resource in a scope under `repo_prefix`
pub fn namespace_scope(scope: &str, repo_prefix: &str) -> String {
    scope.replacen(
        REPOSITORY_SCOPE,
        &format!("{}{}/", REPOSITORY_SCOPE, repo_prefix),
        1,
    )
}

/// Rewrite every `scope` parameter of a token request query.
///
/// Queries without a non-empty `scope` are returned unmodified. Otherwise the
/// query is re-encoded with its parameters in their original order.
pub fn rewrite_token_query(query: &str, repo_prefix: &str) -> String {
    let has_scope = form_urlencoded::parse(query.as_bytes())
        .any(|(key, value)| key == "scope" && !value.is_empty());
    if !has_scope {
        return query.to_string();
    }

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key == "scope" {
            serializer.append_pair(&key, &namespace_scope(&value, repo_prefix));
        } else {
            serializer.append_pair(&key, &value);
        }
    }
    serializer.finish()
}

/// Target URL for a token request: the discovered endpoint with the inbound
/// query (rewritten) in place of its own.
///
/// Without an inbound query the endpoint URL is used as discovered.
pub fn token_request_url(endpoint: &Url, query: Option<&str>, repo_prefix: &str) -> Url {
    let mut url = endpoint.clone();
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.set_query(Some(&rewrite_token_query(query, repo_prefix)));
    }
    url
}
