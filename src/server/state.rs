use crate::server::auth::Authenticator;
use crate::server::proxy::PROXY_USER_AGENT;
use crate::server::registry::models::RegistryConfig;
use crate::server::settings::ServerSettings;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Full state for HTTP server
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RegistryConfig>,
    /// Where registry API requests are sent, normally `https://<registry host>`
    pub registry_base: Arc<Url>,
    /// Token endpoint discovered from the upstream registry at startup
    pub token_endpoint: Arc<Url>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(
        registry: RegistryConfig,
        registry_base: Url,
        token_endpoint: Url,
        authenticator: Option<Arc<dyn Authenticator>>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            registry_base: Arc::new(registry_base),
            token_endpoint: Arc::new(token_endpoint),
            authenticator,
            http_client,
        }
    }
}

/// Build the client shared by discovery, the proxies and the metadata token refresh.
///
/// Redirects are never followed; the registry's blob redirects go back to the client.
pub fn build_http_client(settings: &ServerSettings) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(PROXY_USER_AGENT);

    if let Some(secs) = settings.upstream_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    builder.build().context("Failed to create HTTP client")
}
