pub mod metadata;
pub mod static_header;

pub use metadata::{MetadataTokenAuthenticator, MetadataTokenError};
pub use static_header::StaticHeaderAuthenticator;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

use crate::server::settings::AuthSettings;

/// Source of the `Authorization` header sent to the upstream registry
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Current header value, e.g. `Bearer ya29...` or `Basic ...`
    ///
    /// Implementations return a snapshot; callers never hold on to internal state.
    async fn auth_header(&self) -> String;
}

/// Authenticator chosen from the settings, plus its background task if it has one
pub struct InitializedAuth {
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Metadata token refresh task. Completes only when refreshing failed for good.
    pub refresh_task: Option<JoinHandle<Result<(), MetadataTokenError>>>,
}

/// Resolve [`AuthSettings`] into a concrete authenticator.
///
/// Credential material is loaded here, so an unreadable key file or a failed
/// first metadata fetch aborts startup.
pub async fn init_authenticator(settings: &AuthSettings, client: &Client) -> Result<InitializedAuth> {
    match settings {
        AuthSettings::None => {
            tracing::info!("No upstream authentication configured");
            Ok(InitializedAuth {
                authenticator: None,
                refresh_task: None,
            })
        }
        AuthSettings::StaticHeader { header } => {
            tracing::info!("Using static authorization header for upstream requests");
            Ok(InitializedAuth {
                authenticator: Some(Arc::new(StaticHeaderAuthenticator::new(header.clone()))),
                refresh_task: None,
            })
        }
        AuthSettings::ServiceAccountKey { path } => {
            let authenticator = StaticHeaderAuthenticator::from_service_account_key(path)?;
            tracing::info!("Using service account key from {}", path);
            Ok(InitializedAuth {
                authenticator: Some(Arc::new(authenticator)),
                refresh_task: None,
            })
        }
        AuthSettings::MetadataServer {
            endpoint,
            refresh_margin_secs,
        } => {
            let endpoint = Url::parse(endpoint)
                .with_context(|| format!("Invalid metadata server endpoint '{}'", endpoint))?;

            let authenticator = Arc::new(
                MetadataTokenAuthenticator::new(
                    client.clone(),
                    endpoint,
                    Duration::from_secs(*refresh_margin_secs),
                )
                .await
                .context("Failed to fetch initial token from the metadata server")?,
            );
            tracing::info!("Using metadata server tokens for upstream requests");

            let refresh_task = Arc::clone(&authenticator).start();
            Ok(InitializedAuth {
                authenticator: Some(authenticator),
                refresh_task: Some(refresh_task),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_none_has_no_authenticator() {
        let auth = init_authenticator(&AuthSettings::None, &Client::new())
            .await
            .unwrap();
        assert!(auth.authenticator.is_none());
        assert!(auth.refresh_task.is_none());
    }

    #[tokio::test]
    async fn test_static_header() {
        let settings = AuthSettings::StaticHeader {
            header: "Bearer static".to_string(),
        };
        let auth = init_authenticator(&settings, &Client::new()).await.unwrap();
        assert_eq!(auth.authenticator.unwrap().auth_header().await, "Bearer static");
        assert!(auth.refresh_task.is_none());
    }

    #[tokio::test]
    async fn test_service_account_key() {
        let mut key = tempfile::NamedTempFile::new().unwrap();
        write!(key, "{{}}").unwrap();

        let settings = AuthSettings::ServiceAccountKey {
            path: key.path().to_string_lossy().into_owned(),
        };
        let auth = init_authenticator(&settings, &Client::new()).await.unwrap();

        // base64("_json_key:{}")
        assert_eq!(
            auth.authenticator.unwrap().auth_header().await,
            "Basic X2pzb25fa2V5Ont9"
        );
    }

    #[tokio::test]
    async fn test_missing_key_file_is_fatal() {
        let settings = AuthSettings::ServiceAccountKey {
            path: "/nonexistent/key.json".to_string(),
        };
        assert!(init_authenticator(&settings, &Client::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_metadata_server_starts_refresh_task() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        let settings = AuthSettings::MetadataServer {
            endpoint: format!("{}/token", server.uri()),
            refresh_margin_secs: 300,
        };
        let auth = init_authenticator(&settings, &Client::new()).await.unwrap();

        assert_eq!(auth.authenticator.unwrap().auth_header().await, "Bearer abc");
        let task = auth.refresh_task.unwrap();
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn test_failed_initial_metadata_fetch_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let settings = AuthSettings::MetadataServer {
            endpoint: format!("{}/token", server.uri()),
            refresh_margin_secs: 300,
        };
        assert!(init_authenticator(&settings, &Client::new()).await.is_err());
    }
}
