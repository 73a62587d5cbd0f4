use serde::Deserialize;

/// Upstream registry and the namespace every proxied repository lives under
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Registry hostname without scheme (e.g., "gcr.io")
    pub host: String,
    /// Path segment injected after `/v2/` (e.g., "my-project")
    pub repo_prefix: String,
}

impl RegistryConfig {
    #[cfg(test)]
    pub fn new(host: impl Into<String>, repo_prefix: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            repo_prefix: repo_prefix.into(),
        }
    }
}
