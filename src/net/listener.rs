//! TCP listener binding.

use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid bind address '{0}'")]
    Address(String),

    #[error("failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}

/// Parse the configured bind address.
pub fn bind_address(config: &ListenerConfig) -> Result<SocketAddr, ListenerError> {
    config
        .bind_address
        .parse()
        .map_err(|_| ListenerError::Address(config.bind_address.clone()))
}

/// Bind a plain TCP listener on the configured address.
pub async fn bind(config: &ListenerConfig) -> Result<TcpListener, ListenerError> {
    let listener = TcpListener::bind(bind_address(config)?).await?;
    tracing::info!(
        address = %listener.local_addr()?,
        max_connections = config.max_connections,
        "Listener bound"
    );
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let config = ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
            ..ListenerConfig::default()
        };
        let listener = bind(&config).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn rejects_bad_address() {
        let config = ListenerConfig {
            bind_address: "localhost".into(),
            ..ListenerConfig::default()
        };
        assert!(matches!(bind_address(&config), Err(ListenerError::Address(_))));
    }
}
