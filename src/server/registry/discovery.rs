use axum::http::header;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::server::registry::rewrite::{realm_from_challenge, API_VERSION_PATH};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to query the registry at {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("www-authenticate header not returned from {0}, cannot locate token endpoint")]
    MissingChallenge(String),

    #[error("cannot locate 'realm' in {url} response header www-authenticate: {challenge}")]
    MissingRealm { url: String, challenge: String },

    #[error("token realm '{realm}' advertised by {url} is not a valid URL: {source}")]
    InvalidRealm {
        url: String,
        realm: String,
        #[source]
        source: url::ParseError,
    },
}

/// Learn the upstream registry's token endpoint from the challenge on `GET /v2/`
pub async fn discover_token_endpoint(
    client: &Client,
    registry_host: &str,
) -> Result<Url, DiscoveryError> {
    let version_url = format!("https://{}{}", registry_host, API_VERSION_PATH);
    query_token_endpoint(client, &version_url).await
}

/// Send an unauthenticated request to `version_url` and parse the realm it advertises
pub async fn query_token_endpoint(client: &Client, version_url: &str) -> Result<Url, DiscoveryError> {
    tracing::debug!("Querying {} for the registry token endpoint", version_url);

    let response = client
        .get(version_url)
        .send()
        .await
        .map_err(|source| DiscoveryError::Request {
            url: version_url.to_string(),
            source,
        })?;

    let challenge = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DiscoveryError::MissingChallenge(version_url.to_string()))?;

    let realm = realm_from_challenge(challenge).ok_or_else(|| DiscoveryError::MissingRealm {
        url: version_url.to_string(),
        challenge: challenge.to_string(),
    })?;

    Url::parse(realm).map_err(|source| DiscoveryError::InvalidRealm {
        url: version_url.to_string(),
        realm: realm.to_string(),
        source,
    })
}
