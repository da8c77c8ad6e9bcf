//! Ordered authentication filters sharing one cache.

use axum::http::HeaderMap;
use std::sync::Arc;

use crate::auth::cache::{AuthenticationCache, CacheSettings};
use crate::auth::filter::{
    Authenticator, BasicAuthenticator, HeaderAuthenticator, TokenAuthenticator,
};
use crate::auth::{AuthError, Authentication};
use crate::config::schema::AuthConfig;

/// Names accepted in `auth.filters`.
pub const KNOWN_FILTERS: &[&str] = &[
    BasicAuthenticator::NAME,
    TokenAuthenticator::NAME,
    HeaderAuthenticator::NAME,
];

#[derive(Debug, thiserror::Error)]
#[error("unknown authentication filter '{0}'")]
pub struct UnknownFilter(pub String);

/// Tries each filter in order; the first one whose credentials are present
/// decides.
pub struct FilterChain {
    filters: Vec<Arc<dyn Authenticator>>,
    cache: Arc<AuthenticationCache>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn Authenticator>>, cache: Arc<AuthenticationCache>) -> Self {
        Self { filters, cache }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, UnknownFilter> {
        let filters = config
            .filters
            .iter()
            .map(|name| -> Result<Arc<dyn Authenticator>, UnknownFilter> {
                match name.as_str() {
                    BasicAuthenticator::NAME => Ok(Arc::new(BasicAuthenticator::new(&config.users))),
                    TokenAuthenticator::NAME => Ok(Arc::new(TokenAuthenticator::new(&config.tokens))),
                    HeaderAuthenticator::NAME => Ok(Arc::new(HeaderAuthenticator::new(
                        config.header.clone(),
                        &config.users,
                    ))),
                    other => Err(UnknownFilter(other.to_string())),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cache = Arc::new(AuthenticationCache::new(CacheSettings::from(&config.cache)));
        Ok(Self::new(filters, cache))
    }

    pub fn cache(&self) -> &Arc<AuthenticationCache> {
        &self.cache
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Authenticate a request.
    ///
    /// `Ok(None)` means no filter found credentials (anonymous). An error
    /// from the deciding filter stops the chain.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Authentication>, AuthError> {
        for filter in &self.filters {
            let Some(credentials) = filter.extract(headers)? else {
                continue;
            };

            let key = credentials.cache_key();
            if let Some(cached) = self.cache.get(filter.name(), &key) {
                tracing::trace!(filter = filter.name(), principal = %cached.principal, "Authentication cache hit");
                return Ok(Some(cached));
            }

            let verifier = Arc::clone(filter);
            let outcome = tokio::task::spawn_blocking(move || verifier.authenticate(&credentials)).await?;
            return match outcome {
                Ok(authentication) => {
                    tracing::debug!(
                        filter = filter.name(),
                        principal = %authentication.principal,
                        "Authenticated"
                    );
                    self.cache.put(filter.name(), &key, authentication.clone());
                    Ok(Some(authentication))
                }
                Err(e) => {
                    tracing::warn!(filter = filter.name(), error = %e, "Authentication failed");
                    Err(e)
                }
            };
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::filter::Credentials;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts any bearer token and counts verifications.
    struct Counting {
        calls: AtomicUsize,
    }

    impl Authenticator for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn extract(&self, headers: &HeaderMap) -> Result<Option<Credentials>, AuthError> {
            TokenAuthenticator::new(&[]).extract(headers)
        }

        fn authenticate(&self, credentials: &Credentials) -> Result<Authentication, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match credentials {
                Credentials::Bearer(t) if t != "bad" => Ok(Authentication::new(t.clone(), vec![], "counting")),
                _ => Err(AuthError::BadCredentials {
                    filter: "counting".into(),
                }),
            }
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers
    }

    fn chain() -> (FilterChain, Arc<Counting>) {
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(AuthenticationCache::new(CacheSettings::default()));
        let filters: Vec<Arc<dyn Authenticator>> = vec![
            Arc::new(BasicAuthenticator::new(&[])),
            counting.clone() as Arc<dyn Authenticator>,
        ];
        let chain = FilterChain::new(filters, cache);
        (chain, counting)
    }

    #[tokio::test]
    async fn caches_successful_authentications() {
        let (chain, counting) = chain();
        let first = chain.authenticate(&bearer("alice")).await.unwrap().unwrap();
        let second = chain.authenticate(&bearer("alice")).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.cache().keys_for("counting").len(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (chain, counting) = chain();
        assert!(chain.authenticate(&bearer("bad")).await.is_err());
        assert!(chain.authenticate(&bearer("bad")).await.is_err());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        assert!(chain.cache().is_empty());
    }

    #[tokio::test]
    async fn no_credentials_is_anonymous() {
        let (chain, _) = chain();
        assert!(chain.authenticate(&HeaderMap::new()).await.unwrap().is_none());
    }

    #[test]
    fn from_config_rejects_unknown_filters() {
        let config = AuthConfig {
            filters: vec!["basic".into(), "kerberos".into()],
            ..AuthConfig::default()
        };
        assert!(FilterChain::from_config(&config).is_err());

        let chain = FilterChain::from_config(&AuthConfig::default()).unwrap();
        assert_eq!(chain.filter_names(), vec!["basic", "token"]);
        assert_eq!(chain.cache().settings().max_entries, 1000);
    }
}
