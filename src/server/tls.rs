use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::{ring::default_provider, CryptoProvider};

use crate::server::settings::TlsSettings;

/// Load the serving certificate and key from PEM files
pub async fn load_rustls_config(tls: &TlsSettings) -> Result<RustlsConfig> {
    // Ensure crypto provider is installed (rustls 0.23+ requirement)
    let _ = CryptoProvider::install_default(default_provider());

    RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .with_context(|| {
            format!(
                "Failed to load TLS certificate {} and key {}",
                tls.cert_path, tls.key_path
            )
        })
}
