//! Authentication filters.
//!
//! A filter first extracts its kind of credentials from the request headers.
//! Extraction is cheap and yields the cache key; verification (bcrypt for
//! basic auth) only runs on a cache miss.

use axum::http::{header, HeaderMap};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::auth::{AuthError, Authentication};
use crate::config::schema::{HeaderAuthConfig, TokenConfig, UserConfig};

/// Credentials found on a request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
    /// A principal asserted by a trusted fronting proxy.
    Trusted {
        principal: String,
        roles: Option<Vec<String>>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => {
                f.debug_struct("Basic").field("username", username).finish_non_exhaustive()
            }
            Credentials::Bearer(_) => f.write_str("Bearer(..)"),
            Credentials::Trusted { principal, roles } => f
                .debug_struct("Trusted")
                .field("principal", principal)
                .field("roles", roles)
                .finish(),
        }
    }
}

impl Credentials {
    /// Hex SHA-256 of the credential material.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            Credentials::Basic { username, password } => {
                hasher.update(b"basic\0");
                hasher.update(username.as_bytes());
                hasher.update(b":");
                hasher.update(password.as_bytes());
            }
            Credentials::Bearer(token) => {
                hasher.update(b"bearer\0");
                hasher.update(token.as_bytes());
            }
            Credentials::Trusted { principal, roles } => {
                hasher.update(b"trusted\0");
                hasher.update(principal.as_bytes());
                if let Some(roles) = roles {
                    hasher.update(b"\0");
                    hasher.update(roles.join(",").as_bytes());
                }
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// A named way of authenticating requests.
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &str;

    /// Credentials of this filter's kind, if the request carries any.
    fn extract(&self, headers: &HeaderMap) -> Result<Option<Credentials>, AuthError>;

    /// Verify credentials. May block; callers run it off the async runtime.
    fn authenticate(&self, credentials: &Credentials) -> Result<Authentication, AuthError>;
}

fn authorization<'a>(headers: &'a HeaderMap, scheme: &str) -> Option<&'a str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (s, rest) = value.split_once(' ')?;
    s.eq_ignore_ascii_case(scheme).then(|| rest.trim())
}

/// HTTP Basic against the configured user table (bcrypt hashes).
pub struct BasicAuthenticator {
    users: HashMap<String, UserConfig>,
}

impl BasicAuthenticator {
    pub const NAME: &'static str = "basic";

    pub fn new(users: &[UserConfig]) -> Self {
        Self {
            users: users.iter().map(|u| (u.name.clone(), u.clone())).collect(),
        }
    }
}

impl Authenticator for BasicAuthenticator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn extract(&self, headers: &HeaderMap) -> Result<Option<Credentials>, AuthError> {
        let Some(encoded) = authorization(headers, "Basic") else {
            return Ok(None);
        };
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| AuthError::Malformed("basic credentials are not base64"))?;
        let decoded =
            String::from_utf8(decoded).map_err(|_| AuthError::Malformed("basic credentials are not UTF-8"))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or(AuthError::Malformed("basic credentials lack ':'"))?;
        Ok(Some(Credentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }))
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<Authentication, AuthError> {
        let bad = || AuthError::BadCredentials {
            filter: Self::NAME.to_string(),
        };
        let Credentials::Basic { username, password } = credentials else {
            return Err(bad());
        };
        let user = self.users.get(username).ok_or_else(bad)?;
        if bcrypt::verify(password, &user.password_hash)? {
            Ok(Authentication::new(username.clone(), user.roles.clone(), Self::NAME))
        } else {
            Err(bad())
        }
    }
}

/// `Authorization: Bearer <token>` against configured API tokens.
pub struct TokenAuthenticator {
    tokens: HashMap<String, TokenConfig>,
}

impl TokenAuthenticator {
    pub const NAME: &'static str = "token";

    pub fn new(tokens: &[TokenConfig]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| (t.token.clone(), t.clone())).collect(),
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn extract(&self, headers: &HeaderMap) -> Result<Option<Credentials>, AuthError> {
        Ok(authorization(headers, "Bearer")
            .filter(|t| !t.is_empty())
            .map(|t| Credentials::Bearer(t.to_string())))
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<Authentication, AuthError> {
        match credentials {
            Credentials::Bearer(token) => self
                .tokens
                .get(token)
                .map(|t| Authentication::new(t.principal.clone(), t.roles.clone(), Self::NAME))
                .ok_or_else(|| AuthError::BadCredentials {
                    filter: Self::NAME.to_string(),
                }),
            _ => Err(AuthError::BadCredentials {
                filter: Self::NAME.to_string(),
            }),
        }
    }
}

/// Trusts a header naming the principal, as set by a fronting SSO proxy.
pub struct HeaderAuthenticator {
    config: HeaderAuthConfig,
    /// Roles of known users, used when no roles header is configured.
    roles: HashMap<String, Vec<String>>,
}

impl HeaderAuthenticator {
    pub const NAME: &'static str = "header";

    pub fn new(config: HeaderAuthConfig, users: &[UserConfig]) -> Self {
        Self {
            config,
            roles: users.iter().map(|u| (u.name.clone(), u.roles.clone())).collect(),
        }
    }
}

impl Authenticator for HeaderAuthenticator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn extract(&self, headers: &HeaderMap) -> Result<Option<Credentials>, AuthError> {
        let principal = match headers.get(self.config.user_header.as_str()) {
            Some(v) => v
                .to_str()
                .map_err(|_| AuthError::Malformed("principal header is not visible ASCII"))?
                .trim(),
            None => return Ok(None),
        };
        if principal.is_empty() {
            return Ok(None);
        }
        let roles = self
            .config
            .roles_header
            .as_deref()
            .and_then(|h| headers.get(h))
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(String::from)
                    .collect()
            });
        Ok(Some(Credentials::Trusted {
            principal: principal.to_string(),
            roles,
        }))
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<Authentication, AuthError> {
        match credentials {
            Credentials::Trusted { principal, roles } => {
                let roles = roles
                    .clone()
                    .or_else(|| self.roles.get(principal).cloned())
                    .unwrap_or_default();
                Ok(Authentication::new(principal.clone(), roles, Self::NAME))
            }
            _ => Err(AuthError::BadCredentials {
                filter: Self::NAME.to_string(),
            }),
        }
    }
}
