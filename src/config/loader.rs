//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::GateConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<GateConfig, ConfigError> {
    let config: GateConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GateConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RateScope;

    #[test]
    fn parses_a_full_file() {
        let config = parse_config(
            r#"
            [upstream]
            url = "http://geoserver:8080/geoserver"

            [auth]
            allow_anonymous = false
            filters = ["header", "basic"]

            [auth.header]
            user_header = "X-Remote-User"

            [flow]
            global = 100
            user = 6
            ip_blocklist = ["192.168.1.66"]

            [[flow.ows]]
            matcher = "wms.getmap"
            limit = 16

            [[flow.rates]]
            scope = "ip"
            matcher = "wps"
            rule = "300/m;3s"
            "#,
        )
        .unwrap();

        assert!(!config.auth.allow_anonymous);
        assert_eq!(config.auth.filters, vec!["header", "basic"]);
        assert_eq!(config.auth.header.user_header, "X-Remote-User");
        assert_eq!(config.flow.global, Some(100));
        assert_eq!(config.flow.ows[0].limit, 16);
        assert_eq!(config.flow.rates[0].scope, RateScope::Ip);
        assert_eq!(config.flow.timeout_secs, 60);
    }

    #[test]
    fn reports_parse_and_validation_failures() {
        assert!(matches!(parse_config("[flow]\nglobal = \"many\""), Err(ConfigError::Parse(_))));

        let err = parse_config("[flow]\nglobal = 0\nuser = 0").unwrap_err();
        match &err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("flow.global: must be positive when set"));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            load_config(Path::new("/nonexistent/ows-gate.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
