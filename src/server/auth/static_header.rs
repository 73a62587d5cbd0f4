use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::Path;

use super::Authenticator;

/// Authenticator that always returns the same header value
pub struct StaticHeaderAuthenticator {
    header: String,
}

impl StaticHeaderAuthenticator {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }

    /// Build `Basic` credentials from a service account JSON key file.
    ///
    /// Registries that accept key files expect the username `_json_key` and the
    /// file contents as the password.
    pub fn from_service_account_key(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account key {}", path.display()))?;

        let credentials = STANDARD.encode(format!("_json_key:{}", contents));
        Ok(Self::new(format!("Basic {}", credentials)))
    }
}

#[async_trait]
impl Authenticator for StaticHeaderAuthenticator {
    async fn auth_header(&self) -> String {
        self.header.clone()
    }
}
