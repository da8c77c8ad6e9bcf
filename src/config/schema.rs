//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GateConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// The OGC server requests are forwarded to.
    pub upstream: UpstreamConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Authentication filters and cache.
    pub auth: AuthConfig,

    /// Request admission (flow control).
    pub flow: FlowConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the upstream OGC server (e.g., "http://127.0.0.1:8600").
    pub url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8600".to_string(),
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Total time for request/response, including time queued, in seconds.
    pub request_secs: u64,

    /// Time allowed for the upstream to produce response headers, in seconds.
    pub upstream_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 120,
            upstream_secs: 60,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Let requests without credentials through as anonymous.
    pub allow_anonymous: bool,

    /// Realm announced in Basic challenges.
    pub realm: String,

    /// Filter names, in the order they are tried.
    pub filters: Vec<String>,

    pub cache: AuthCacheConfig,

    pub header: HeaderAuthConfig,

    /// Users known to the basic and header filters.
    pub users: Vec<UserConfig>,

    /// API tokens known to the token filter.
    pub tokens: Vec<TokenConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            realm: "ows-gate".to_string(),
            filters: vec!["basic".to_string(), "token".to_string()],
            cache: AuthCacheConfig::default(),
            header: HeaderAuthConfig::default(),
            users: Vec::new(),
            tokens: Vec::new(),
        }
    }
}

/// Authentication cache bounds. A zero idle or live time disables that bound.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthCacheConfig {
    pub time_to_idle_secs: u64,
    pub time_to_live_secs: u64,
    pub max_entries: usize,
    /// How often expired entries are swept, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for AuthCacheConfig {
    fn default() -> Self {
        Self {
            time_to_idle_secs: 300,
            time_to_live_secs: 600,
            max_entries: 1000,
            sweep_interval_secs: 60,
        }
    }
}

/// Trusted-header authentication (principal set by a fronting SSO proxy).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeaderAuthConfig {
    pub user_header: String,
    /// Optional header carrying comma separated roles.
    pub roles_header: Option<String>,
}

impl Default for HeaderAuthConfig {
    fn default() -> Self {
        Self {
            user_header: "X-Authenticated-User".to_string(),
            roles_header: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub name: String,

    /// bcrypt hash of the password.
    pub password_hash: String,

    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    pub token: String,
    pub principal: String,

    #[serde(default)]
    pub roles: Vec<String>,
}

/// Flow control configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowConfig {
    pub enabled: bool,

    /// Longest a request may wait in queues before being rejected, in seconds.
    pub timeout_secs: u64,

    /// Maximum concurrent OWS requests overall.
    pub global: Option<usize>,

    /// Maximum concurrent OWS requests per user.
    pub user: Option<usize>,

    /// Maximum concurrent OWS requests per client IP.
    pub ip: Option<usize>,

    /// Cookie identifying anonymous users across requests.
    pub user_cookie: String,

    /// Per-user and per-IP queues unused for this long are dropped, in seconds.
    pub keyed_queue_idle_secs: u64,

    /// Client addresses refused outright.
    pub ip_blocklist: Vec<String>,

    pub priority: Option<PriorityConfig>,

    /// Per service/request/format limits.
    pub ows: Vec<OwsLimitConfig>,

    /// Limits for individual client addresses.
    pub single_ip: Vec<SingleIpConfig>,

    pub rates: Vec<RateConfig>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 60,
            global: None,
            user: None,
            ip: None,
            user_cookie: "OWS_FLOW_CONTROL".to_string(),
            keyed_queue_idle_secs: 300,
            ip_blocklist: Vec::new(),
            priority: None,
            ows: Vec::new(),
            single_ip: Vec::new(),
            rates: Vec::new(),
        }
    }
}

/// Header-driven queue priority.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PriorityConfig {
    pub header: String,
    #[serde(default)]
    pub default: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OwsLimitConfig {
    /// `service[.request[.format]]`, e.g. "wms.getmap.image/png".
    pub matcher: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SingleIpConfig {
    pub ip: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RateScope {
    User,
    Ip,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateConfig {
    pub scope: RateScope,

    /// Restrict the rate to matching OWS requests.
    #[serde(default)]
    pub matcher: Option<String>,

    /// `<count>/<unit>[;<delay>s]`, unit one of s, m, h, d.
    pub rule: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: GateConfig = toml::from_str("").unwrap();
        assert_eq!(config.auth.cache.time_to_idle_secs, 300);
        assert_eq!(config.auth.cache.time_to_live_secs, 600);
        assert_eq!(config.auth.cache.max_entries, 1000);
        assert_eq!(config.flow.timeout_secs, 60);
        assert!(config.flow.global.is_none());
    }

    #[test]
    fn parses_flow_rules() {
        let config: GateConfig = toml::from_str(
            r#"
            [flow]
            global = 100
            user = 6
            ip_blocklist = ["10.0.0.9"]
            priority = { header = "X-Priority", default = 5 }

            [[flow.ows]]
            matcher = "wms.getmap"
            limit = 10

            [[flow.single_ip]]
            ip = "192.168.1.8"
            limit = 2

            [[flow.rates]]
            scope = "ip"
            matcher = "wps.execute"
            rule = "100/m;5s"
            "#,
        )
        .unwrap();

        assert_eq!(config.flow.global, Some(100));
        assert_eq!(config.flow.user, Some(6));
        assert_eq!(config.flow.ows[0].limit, 10);
        assert_eq!(config.flow.single_ip[0].ip, "192.168.1.8");
        assert_eq!(config.flow.rates[0].scope, RateScope::Ip);
        assert_eq!(config.flow.priority.as_ref().unwrap().default, 5);
    }
}
