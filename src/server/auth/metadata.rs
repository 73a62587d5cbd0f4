//! Metadata service token authenticator
//!
//! Fetches a short-lived access token from the platform metadata service at
//! startup and keeps it fresh from a background task, refreshing a fixed
//! margin before the advertised expiry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::Authenticator;

/// First wait after a failed refresh
const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(5);
/// Upper bound for the doubling retry wait
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
/// Never schedule refreshes closer together than this
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MetadataTokenError {
    #[error("failed to reach metadata server at {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("metadata server returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to decode metadata token response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("metadata token expired at {expired_at} without a successful refresh")]
    Expired {
        expired_at: DateTime<Utc>,
        #[source]
        last_error: Box<MetadataTokenError>,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    token_type: String,
}

/// Token and deadlines, always replaced as a whole
struct TokenState {
    auth_header: String,
    expires_at: DateTime<Utc>,
    next_refresh_at: DateTime<Utc>,
}

/// Delay until the next refresh for a token valid for `expires_in`.
///
/// Refreshes `margin` before expiry. Tokens that do not outlive the margin are
/// refreshed at half their lifetime.
pub fn refresh_delay(expires_in: Duration, margin: Duration) -> Duration {
    let delay = if expires_in > margin {
        expires_in - margin
    } else {
        expires_in / 2
    };
    delay.max(MIN_REFRESH_DELAY)
}

/// `now + delay`, saturating instead of overflowing on absurd lifetimes
fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time left until `deadline`, zero once it has passed
fn until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

pub struct MetadataTokenAuthenticator {
    client: Client,
    endpoint: Url,
    refresh_margin: Duration,
    state: RwLock<TokenState>,
}

impl MetadataTokenAuthenticator {
    /// Fetch the first token. Fails if the metadata server cannot provide one.
    pub async fn new(
        client: Client,
        endpoint: Url,
        refresh_margin: Duration,
    ) -> Result<Self, MetadataTokenError> {
        let state = Self::fetch(&client, &endpoint, refresh_margin).await?;
        info!(
            expires_at = %state.expires_at,
            next_refresh_at = %state.next_refresh_at,
            "Fetched initial metadata server token"
        );

        Ok(Self {
            client,
            endpoint,
            refresh_margin,
            state: RwLock::new(state),
        })
    }

    async fn fetch(
        client: &Client,
        endpoint: &Url,
        refresh_margin: Duration,
    ) -> Result<TokenState, MetadataTokenError> {
        let response = client
            .get(endpoint.clone())
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|source| MetadataTokenError::Request {
                url: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MetadataTokenError::Status { status, body });
        }

        let token: TokenResponse = response.json().await.map_err(MetadataTokenError::Decode)?;

        let now = Utc::now();
        let expires_in = Duration::from_secs(token.expires_in);
        Ok(TokenState {
            auth_header: format!("{} {}", token.token_type, token.access_token),
            expires_at: deadline_after(now, expires_in),
            next_refresh_at: deadline_after(now, refresh_delay(expires_in, refresh_margin)),
        })
    }

    /// Fetch a new token and swap it in
    pub async fn refresh(&self) -> Result<(), MetadataTokenError> {
        let state = Self::fetch(&self.client, &self.endpoint, self.refresh_margin).await?;
        let (expires_at, next_refresh_at) = (state.expires_at, state.next_refresh_at);

        *self.state.write().await = state;

        info!(
            expires_at = %expires_at,
            next_refresh_at = %next_refresh_at,
            "Refreshed metadata server token"
        );
        Ok(())
    }

    /// Time until the current token should be replaced
    pub async fn next_refresh_in(&self) -> Duration {
        until(self.state.read().await.next_refresh_at)
    }

    /// Advertised expiry of the current token
    pub async fn expires_at(&self) -> DateTime<Utc> {
        self.state.read().await.expires_at
    }

    /// Start the refresh loop.
    ///
    /// The task only finishes when the token expired without a successful refresh.
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<(), MetadataTokenError>> {
        tokio::spawn(async move { self.refresh_loop().await })
    }

    async fn refresh_loop(&self) -> Result<(), MetadataTokenError> {
        info!("Metadata token refresh task started");

        loop {
            let wait = self.next_refresh_in().await;
            debug!("Next metadata token refresh in {:?}", wait);
            tokio::time::sleep(wait).await;

            self.refresh_with_retry().await?;
        }
    }

    /// Refresh, retrying with backoff for as long as the current token is valid.
    ///
    /// A failed refresh does not stop the task while the cached token still works;
    /// it keeps being served until its expiry. Only a token that expires before a
    /// refresh succeeds ends the task with [`MetadataTokenError::Expired`].
    async fn refresh_with_retry(&self) -> Result<(), MetadataTokenError> {
        let mut delay = RETRY_INITIAL_DELAY;

        loop {
            let err = match self.refresh().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            let expired_at = self.expires_at().await;
            let remaining = until(expired_at);
            if remaining.is_zero() {
                error!(error = %err, "Metadata token expired and could not be refreshed");
                return Err(MetadataTokenError::Expired {
                    expired_at,
                    last_error: Box::new(err),
                });
            }

            let wait = delay.min(remaining);
            warn!(
                error = %err,
                retry_in = ?wait,
                token_valid_for = ?remaining,
                "Failed to refresh metadata token, retrying"
            );
            tokio::time::sleep(wait).await;
            delay = (delay * 2).min(RETRY_MAX_DELAY);
        }
    }
}

#[async_trait]
impl Authenticator for MetadataTokenAuthenticator {
    async fn auth_header(&self) -> String {
        self.state.read().await.auth_header.clone()
    }
}
