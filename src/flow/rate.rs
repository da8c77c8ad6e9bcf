//! Request rate limits over fixed time windows.
//!
//! Rules read `<count>/<unit>[;<delay>s]`: at most `count` requests per
//! second, minute, hour or day. With a delay, excess requests are held back
//! for that long and then served; without one they are rejected with 429.

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::config::schema::RateScope;
use crate::flow::controller::{ControllerStats, FlowController, Ticket};
use crate::flow::keys::RequestContext;
use crate::flow::ows::OwsMatcher;
use crate::flow::{RateHeaders, Rejection};

/// A parsed rate rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub limit: u64,
    pub period: Duration,
    pub delay: Option<Duration>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid rate rule '{rule}': {reason}")]
pub struct RateRuleError {
    pub rule: String,
    pub reason: &'static str,
}

impl FromStr for RateRule {
    type Err = RateRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| RateRuleError {
            rule: s.to_string(),
            reason,
        };

        let (rate, delay) = match s.split_once(';') {
            Some((rate, delay)) => (rate.trim(), Some(delay.trim())),
            None => (s.trim(), None),
        };

        let (count, unit) = rate.split_once('/').ok_or_else(|| err("expected <count>/<unit>"))?;
        let limit: u64 = count
            .trim()
            .parse()
            .map_err(|_| err("count is not a number"))?;
        if limit == 0 {
            return Err(err("count must be positive"));
        }
        let period = match unit.trim() {
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            "d" => Duration::from_secs(86_400),
            _ => return Err(err("unit must be one of s, m, h, d")),
        };

        let delay = match delay {
            None => None,
            Some(d) => {
                let secs: u64 = d
                    .strip_suffix('s')
                    .ok_or_else(|| err("delay must end in 's'"))?
                    .parse()
                    .map_err(|_| err("delay is not a number"))?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
        };

        Ok(Self { limit, period, delay })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    id: u64,
    count: u64,
}

/// Counts requests per user or client address in fixed windows.
pub struct RateController {
    name: String,
    scope: RateScope,
    matcher: Option<OwsMatcher>,
    rule: RateRule,
    windows: DashMap<String, Window>,
    delayed: AtomicUsize,
}

impl RateController {
    pub fn new(scope: RateScope, matcher: Option<OwsMatcher>, rule: RateRule) -> Self {
        let prefix = match scope {
            RateScope::User => "rate.user",
            RateScope::Ip => "rate.ip",
        };
        let name = match &matcher {
            Some(m) => format!("{}.{}", prefix, m),
            None => prefix.to_string(),
        };
        Self {
            name,
            scope,
            matcher,
            rule,
            windows: DashMap::new(),
            delayed: AtomicUsize::new(0),
        }
    }

    fn context(&self) -> String {
        match &self.matcher {
            Some(m) => m.to_string(),
            None => "Any OGC request".to_string(),
        }
    }

    fn action(&self) -> String {
        match self.rule.delay {
            Some(delay) => format!("Delay excess requests {}ms", delay.as_millis()),
            None => "Reject excess requests".to_string(),
        }
    }

    fn period_ms(&self) -> u64 {
        self.rule.period.as_millis() as u64
    }

    /// Count one request for `key` at `now_ms` and report the window state.
    fn count(&self, key: String, now_ms: u64) -> (u64, RateHeaders) {
        let period = self.period_ms();
        let id = now_ms / period;
        let count = {
            let mut window = self.windows.entry(key).or_insert(Window { id, count: 0 });
            if window.id != id {
                *window = Window { id, count: 0 };
            }
            window.count += 1;
            window.count
        };

        let headers = RateHeaders {
            context: self.context(),
            limit: self.rule.limit,
            remaining: self.rule.limit.saturating_sub(count),
            reset_epoch_ms: (id + 1) * period,
            action: self.action(),
        };
        (count, headers)
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl FlowController for RateController {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> u64 {
        0
    }

    fn applies(&self, ctx: &RequestContext) -> bool {
        match &self.matcher {
            Some(m) => m.matches(&ctx.ows),
            None => ctx.ows.is_ows(),
        }
    }

    fn admit<'a>(
        &'a self,
        ctx: &'a RequestContext,
        _deadline: Instant,
    ) -> BoxFuture<'a, Result<Ticket, Rejection>> {
        Box::pin(async move {
            let key = match self.scope {
                RateScope::User => ctx.user_key.clone(),
                RateScope::Ip => ctx.client_ip.to_string(),
            };
            let (count, headers) = self.count(key, epoch_ms());
            if count <= self.rule.limit {
                return Ok(Ticket::Rate(headers));
            }

            match self.rule.delay {
                Some(delay) => {
                    tracing::debug!(controller = %self.name, ?delay, "Delaying request over rate");
                    self.delayed.fetch_add(1, Ordering::Relaxed);
                    let _undelay = DelayedGuard(&self.delayed);
                    tokio::time::sleep(delay).await;
                    Ok(Ticket::Rate(headers))
                }
                None => Err(Rejection::RateLimited(headers)),
            }
        })
    }

    fn stats(&self) -> ControllerStats {
        ControllerStats {
            name: self.name.clone(),
            limit: self.rule.limit,
            running: 0,
            waiting: self.delayed.load(Ordering::Relaxed),
            keys: self.windows.len(),
        }
    }

    fn prune(&self, _idle: Duration) {
        let current = epoch_ms() / self.period_ms();
        self.windows.retain(|_, w| w.id >= current);
    }
}

/// Decrements the delayed counter even if the delayed request is cancelled.
struct DelayedGuard<'a>(&'a AtomicUsize);

impl Drop for DelayedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ows::OwsRequest;

    fn ctx(ip: &str) -> RequestContext {
        RequestContext::new(OwsRequest::new("wms", Some("getmap"), None), ip.parse().unwrap(), "u")
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn parses_rules() {
        assert_eq!(
            "100/m".parse::<RateRule>().unwrap(),
            RateRule {
                limit: 100,
                period: Duration::from_secs(60),
                delay: None
            }
        );
        let rule: RateRule = "1000/d;30s".parse().unwrap();
        assert_eq!(rule.period, Duration::from_secs(86_400));
        assert_eq!(rule.delay, Some(Duration::from_secs(30)));

        assert!("100".parse::<RateRule>().is_err());
        assert!("0/s".parse::<RateRule>().is_err());
        assert!("10/w".parse::<RateRule>().is_err());
        assert!("10/s;30".parse::<RateRule>().is_err());
    }

    #[test]
    fn windows_reset_on_period_boundary() {
        let c = RateController::new(RateScope::Ip, None, "2/s".parse().unwrap());
        let (n, h) = c.count("a".into(), 10_000);
        assert_eq!((n, h.remaining, h.reset_epoch_ms), (1, 1, 11_000));
        let (n, h) = c.count("a".into(), 10_500);
        assert_eq!((n, h.remaining), (2, 0));
        let (n, _) = c.count("a".into(), 10_999);
        assert_eq!(n, 3);
        let (n, h) = c.count("a".into(), 11_000);
        assert_eq!((n, h.remaining, h.reset_epoch_ms), (1, 1, 12_000));
    }

    #[tokio::test]
    async fn rejects_excess_without_delay() {
        let c = RateController::new(RateScope::Ip, None, "2/h".parse().unwrap());
        assert!(c.admit(&ctx("10.0.0.1"), deadline()).await.is_ok());
        assert!(c.admit(&ctx("10.0.0.1"), deadline()).await.is_ok());

        match c.admit(&ctx("10.0.0.1"), deadline()).await {
            Err(Rejection::RateLimited(h)) => {
                assert_eq!(h.limit, 2);
                assert_eq!(h.remaining, 0);
                assert_eq!(h.action, "Reject excess requests");
                assert_eq!(h.context, "Any OGC request");
            }
            other => panic!("expected rate rejection, got {:?}", other.map(|_| ())),
        }

        // Other clients have their own window.
        assert!(c.admit(&ctx("10.0.0.2"), deadline()).await.is_ok());
    }

    #[tokio::test]
    async fn delays_excess_when_configured() {
        let c = RateController::new(RateScope::Ip, None, "1/h;1s".parse().unwrap());
        c.admit(&ctx("10.0.0.1"), deadline()).await.unwrap();

        let started = std::time::Instant::now();
        let ticket = c.admit(&ctx("10.0.0.1"), deadline()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
        match ticket {
            Ticket::Rate(h) => assert_eq!(h.action, "Delay excess requests 1000ms"),
            Ticket::Slot(_) => panic!("rate controllers never hold slots"),
        }
        assert_eq!(c.stats().waiting, 0);
    }

    #[test]
    fn matcher_restricts_scope() {
        let c = RateController::new(
            RateScope::User,
            Some(OwsMatcher::parse("wps.execute").unwrap()),
            "1/s".parse().unwrap(),
        );
        assert_eq!(c.name(), "rate.user.wps.execute");
        assert!(!c.applies(&ctx("10.0.0.1")));
    }
}
