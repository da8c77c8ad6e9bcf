//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that matchers, rate rules and addresses parse
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Check that authentication can succeed at all
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GateConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use axum::http::uri::{Scheme, Uri};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use crate::auth::chain::KNOWN_FILTERS;
use crate::config::schema::GateConfig;
use crate::flow::ows::OwsMatcher;
use crate::flow::rate::RateRule;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const MAX_CACHE_ENTRIES: usize = 1_000_000;
const MAX_FLOW_TIMEOUT_SECS: u64 = 86_400;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Default)]
struct Errors(Vec<ValidationError>);

impl Errors {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn check(&mut self, ok: bool, field: &str, message: &str) {
        if !ok {
            self.push(field, message);
        }
    }
}

/// Validate `config`, collecting every problem found.
pub fn validate_config(config: &GateConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Errors::default();

    validate_listener(config, &mut errors);
    validate_upstream(config, &mut errors);
    validate_auth(config, &mut errors);
    validate_flow(config, &mut errors);
    validate_ambient(config, &mut errors);

    if errors.0.is_empty() {
        Ok(())
    } else {
        Err(errors.0)
    }
}

fn validate_listener(config: &GateConfig, errors: &mut Errors) {
    let listener = &config.listener;
    errors.check(
        listener.bind_address.parse::<SocketAddr>().is_ok(),
        "listener.bind_address",
        "must be an ip:port socket address",
    );
    errors.check(listener.max_connections > 0, "listener.max_connections", "must be positive");
    if let Some(tls) = &listener.tls {
        errors.check(!tls.cert_path.is_empty(), "listener.tls.cert_path", "must not be empty");
        errors.check(!tls.key_path.is_empty(), "listener.tls.key_path", "must not be empty");
    }

    errors.check(config.timeouts.request_secs > 0, "timeouts.request_secs", "must be positive");
    errors.check(config.timeouts.upstream_secs > 0, "timeouts.upstream_secs", "must be positive");
}

fn validate_upstream(config: &GateConfig, errors: &mut Errors) {
    let ok = config
        .upstream
        .url
        .parse::<Uri>()
        .map(|uri| uri.scheme() == Some(&Scheme::HTTP) && uri.authority().is_some())
        .unwrap_or(false);
    errors.check(ok, "upstream.url", "must be an absolute http:// URL");
}

fn validate_auth(config: &GateConfig, errors: &mut Errors) {
    let auth = &config.auth;

    let mut seen = HashSet::new();
    for name in &auth.filters {
        if !KNOWN_FILTERS.contains(&name.as_str()) {
            errors.push(
                "auth.filters",
                format!("unknown filter '{}', expected one of {:?}", name, KNOWN_FILTERS),
            );
        }
        if !seen.insert(name.as_str()) {
            errors.push("auth.filters", format!("filter '{}' listed twice", name));
        }
    }
    if auth.filters.is_empty() && !auth.allow_anonymous {
        errors.push("auth", "no filters configured and anonymous access is disabled");
    }

    errors.check(auth.cache.max_entries > 0, "auth.cache.max_entries", "must be positive");
    errors.check(
        auth.cache.max_entries <= MAX_CACHE_ENTRIES,
        "auth.cache.max_entries",
        "must not exceed 1000000",
    );
    errors.check(
        auth.cache.sweep_interval_secs > 0,
        "auth.cache.sweep_interval_secs",
        "must be positive",
    );
    errors.check(
        !auth.header.user_header.trim().is_empty(),
        "auth.header.user_header",
        "must not be empty",
    );

    let mut names = HashSet::new();
    for (i, user) in auth.users.iter().enumerate() {
        if user.name.is_empty() || user.name.contains(':') {
            errors.push(format!("auth.users[{}].name", i), "must be non-empty and contain no ':'");
        }
        if !names.insert(user.name.as_str()) {
            errors.push(format!("auth.users[{}].name", i), format!("duplicate user '{}'", user.name));
        }
        if !user.password_hash.starts_with("$2") {
            errors.push(format!("auth.users[{}].password_hash", i), "must be a bcrypt hash");
        }
    }

    let mut tokens = HashSet::new();
    for (i, token) in auth.tokens.iter().enumerate() {
        if token.token.trim().is_empty() {
            errors.push(format!("auth.tokens[{}].token", i), "must not be empty");
        } else if !tokens.insert(token.token.as_str()) {
            errors.push(format!("auth.tokens[{}].token", i), "duplicate token");
        }
        if token.principal.is_empty() {
            errors.push(format!("auth.tokens[{}].principal", i), "must not be empty");
        }
    }
}

fn validate_flow(config: &GateConfig, errors: &mut Errors) {
    let flow = &config.flow;

    errors.check(flow.timeout_secs > 0, "flow.timeout_secs", "must be positive");
    errors.check(
        flow.timeout_secs <= MAX_FLOW_TIMEOUT_SECS,
        "flow.timeout_secs",
        "must not exceed one day (86400)",
    );
    for (field, limit) in [("flow.global", flow.global), ("flow.user", flow.user), ("flow.ip", flow.ip)] {
        if limit == Some(0) {
            errors.push(field, "must be positive when set");
        }
    }

    let cookie_ok = !flow.user_cookie.is_empty()
        && flow
            .user_cookie
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    errors.check(cookie_ok, "flow.user_cookie", "must be a non-empty token of [A-Za-z0-9_-]");

    for (i, entry) in flow.ip_blocklist.iter().enumerate() {
        if entry.trim().parse::<IpAddr>().is_err() {
            errors.push(format!("flow.ip_blocklist[{}]", i), format!("'{}' is not an IP address", entry));
        }
    }

    if let Some(priority) = &flow.priority {
        errors.check(!priority.header.is_empty(), "flow.priority.header", "must not be empty");
    }

    for (i, ows) in flow.ows.iter().enumerate() {
        if let Err(e) = OwsMatcher::parse(&ows.matcher) {
            errors.push(format!("flow.ows[{}].matcher", i), e.to_string());
        }
        if ows.limit == 0 {
            errors.push(format!("flow.ows[{}].limit", i), "must be positive");
        }
    }

    for (i, single) in flow.single_ip.iter().enumerate() {
        if single.ip.parse::<IpAddr>().is_err() {
            errors.push(format!("flow.single_ip[{}].ip", i), format!("'{}' is not an IP address", single.ip));
        }
        if single.limit == 0 {
            errors.push(format!("flow.single_ip[{}].limit", i), "must be positive");
        }
    }

    for (i, rate) in flow.rates.iter().enumerate() {
        if let Some(matcher) = &rate.matcher {
            if let Err(e) = OwsMatcher::parse(matcher) {
                errors.push(format!("flow.rates[{}].matcher", i), e.to_string());
            }
        }
        if let Err(e) = rate.rule.parse::<RateRule>() {
            errors.push(format!("flow.rates[{}].rule", i), e.to_string());
        }
    }
}

fn validate_ambient(config: &GateConfig, errors: &mut Errors) {
    let observability = &config.observability;
    errors.check(
        LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()),
        "observability.log_level",
        "must be one of trace, debug, info, warn, error",
    );
    if observability.metrics_enabled {
        errors.check(
            observability.metrics_address.parse::<SocketAddr>().is_ok(),
            "observability.metrics_address",
            "must be an ip:port socket address",
        );
    }

    let admin = &config.admin;
    if admin.enabled {
        errors.check(!admin.api_key.is_empty(), "admin.api_key", "must not be empty");
        errors.check(
            admin.bind_address.parse::<SocketAddr>().is_ok(),
            "admin.bind_address",
            "must be an ip:port socket address",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{OwsLimitConfig, RateConfig, RateScope, UserConfig};

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&GateConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = GateConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.upstream.url = "https://geo.local".into();
        config.auth.filters = vec!["basic".into(), "basic".into(), "kerberos".into()];
        config.flow.global = Some(0);
        config.flow.ip_blocklist = vec!["10.0.0.0/8".into()];
        config.flow.ows.push(OwsLimitConfig {
            matcher: "".into(),
            limit: 0,
        });
        config.flow.rates.push(RateConfig {
            scope: RateScope::Ip,
            matcher: None,
            rule: "10/week".into(),
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "upstream.url",
                "auth.filters",
                "auth.filters",
                "flow.global",
                "flow.ip_blocklist[0]",
                "flow.ows[0].matcher",
                "flow.ows[0].limit",
                "flow.rates[0].rule",
            ]
        );
    }

    #[test]
    fn rejects_plaintext_passwords_and_closed_gate_without_filters() {
        let mut config = GateConfig::default();
        config.auth.users.push(UserConfig {
            name: "alice".into(),
            password_hash: "secret".into(),
            roles: vec![],
        });
        config.auth.filters.clear();
        config.auth.allow_anonymous = false;

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "auth"));
        assert!(errors.iter().any(|e| e.field == "auth.users[0].password_hash"));
    }

    #[test]
    fn bounds_cache_size_and_queue_timeout() {
        let mut config = GateConfig::default();
        config.auth.cache.max_entries = 10_000_000;
        config.flow.timeout_secs = u64::MAX;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["auth.cache.max_entries", "flow.timeout_secs"]);
    }

    #[test]
    fn admin_checked_only_when_enabled() {
        let mut config = GateConfig::default();
        config.admin.api_key.clear();
        assert!(validate_config(&config).is_ok());

        config.admin.enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "admin.api_key");
    }
}
