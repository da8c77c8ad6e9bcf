//! TLS configuration and certificate loading.

use axum_server::tls_rustls::RustlsConfig;
use std::path::Path;

use crate::config::schema::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("{kind} file not found: {path}")]
    Missing { kind: &'static str, path: String },

    #[error("failed to load certificate or key: {0}")]
    Load(#[from] std::io::Error),
}

/// Load the PEM certificate chain and private key named in `config`.
pub async fn load_tls_config(config: &TlsConfig) -> Result<RustlsConfig, TlsError> {
    for (kind, path) in [("Certificate", &config.cert_path), ("Private key", &config.key_path)] {
        if !Path::new(path).exists() {
            return Err(TlsError::Missing {
                kind,
                path: path.clone(),
            });
        }
    }
    Ok(RustlsConfig::from_pem_file(&config.cert_path, &config.key_path).await?)
}
