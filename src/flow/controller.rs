//! Concurrency controllers.
//!
//! Each controller owns one or more [`SlotQueue`]s and decides which requests
//! it applies to. Keyed controllers (per user, per IP) keep one queue per key
//! and drop queues that stay idle.

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::flow::keys::RequestContext;
use crate::flow::ows::OwsMatcher;
use crate::flow::queue::{AcquireError, SlotPermit, SlotQueue};
use crate::flow::{RateHeaders, Rejection};

/// What a controller hands back when it admits a request.
#[derive(Debug)]
pub enum Ticket {
    /// A concurrency slot, held until the request completes.
    Slot(SlotPermit),
    /// Rate bookkeeping to report on the response.
    Rate(RateHeaders),
}

/// Point-in-time view of a controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    pub name: String,
    pub limit: u64,
    pub running: usize,
    pub waiting: usize,
    /// Live per-key queues or rate windows (keyed controllers only).
    pub keys: usize,
}

/// A named admission rule.
pub trait FlowController: Send + Sync {
    fn name(&self) -> &str;

    /// Controllers are consulted in ascending rank.
    fn rank(&self) -> u64;

    fn applies(&self, ctx: &RequestContext) -> bool;

    fn admit<'a>(
        &'a self,
        ctx: &'a RequestContext,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<Ticket, Rejection>>;

    fn stats(&self) -> ControllerStats;

    /// Drop per-key state unused for `idle`.
    fn prune(&self, _idle: Duration) {}
}

/// Which requests a single-queue controller applies to.
#[derive(Debug, Clone)]
pub enum Selector {
    /// Every OWS request.
    Global,
    Ows(OwsMatcher),
    /// Requests from one client address.
    Ip(IpAddr),
}

/// One queue shared by every request the selector picks.
pub struct ConcurrencyController {
    name: String,
    selector: Selector,
    queue: Arc<SlotQueue>,
}

impl ConcurrencyController {
    pub fn new(selector: Selector, limit: usize) -> Self {
        let name = match &selector {
            Selector::Global => "global".to_string(),
            Selector::Ows(matcher) => format!("ows.{}", matcher),
            Selector::Ip(ip) => format!("ip.{}", ip),
        };
        Self {
            name,
            selector,
            queue: SlotQueue::new(limit),
        }
    }

    pub fn global(limit: usize) -> Self {
        Self::new(Selector::Global, limit)
    }
}

impl FlowController for ConcurrencyController {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> u64 {
        self.queue.capacity() as u64
    }

    fn applies(&self, ctx: &RequestContext) -> bool {
        match &self.selector {
            Selector::Global => ctx.ows.is_ows(),
            Selector::Ows(matcher) => matcher.matches(&ctx.ows),
            Selector::Ip(ip) => ctx.client_ip == *ip,
        }
    }

    fn admit<'a>(
        &'a self,
        ctx: &'a RequestContext,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<Ticket, Rejection>> {
        Box::pin(async move {
            match self.queue.acquire(ctx.priority, deadline).await {
                Ok(permit) => Ok(Ticket::Slot(permit)),
                // Unkeyed queues are never retired.
                Err(AcquireError::Timeout | AcquireError::Retired) => Err(Rejection::timeout(self.name.clone())),
            }
        })
    }

    fn stats(&self) -> ControllerStats {
        ControllerStats {
            name: self.name.clone(),
            limit: self.queue.capacity() as u64,
            running: self.queue.running(),
            waiting: self.queue.waiting(),
            keys: 0,
        }
    }
}

/// Where a keyed controller takes its key from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    User,
    Ip,
}

/// One queue per user or per client address.
pub struct KeyedController {
    name: String,
    source: KeySource,
    limit: usize,
    /// Addresses with their own single-IP controller.
    excluded: HashSet<IpAddr>,
    queues: DashMap<String, Arc<SlotQueue>>,
}

impl KeyedController {
    pub fn per_user(limit: usize) -> Self {
        Self::new(KeySource::User, limit, HashSet::new())
    }

    pub fn per_ip(limit: usize, excluded: HashSet<IpAddr>) -> Self {
        Self::new(KeySource::Ip, limit, excluded)
    }

    fn new(source: KeySource, limit: usize, excluded: HashSet<IpAddr>) -> Self {
        let name = match source {
            KeySource::User => "user",
            KeySource::Ip => "ip",
        };
        Self {
            name: name.to_string(),
            source,
            limit,
            excluded,
            queues: DashMap::new(),
        }
    }

    fn key(&self, ctx: &RequestContext) -> String {
        match self.source {
            KeySource::User => ctx.user_key.clone(),
            KeySource::Ip => ctx.client_ip.to_string(),
        }
    }
}

impl FlowController for KeyedController {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> u64 {
        self.limit as u64
    }

    fn applies(&self, ctx: &RequestContext) -> bool {
        ctx.ows.is_ows() && !(self.source == KeySource::Ip && self.excluded.contains(&ctx.client_ip))
    }

    fn admit<'a>(
        &'a self,
        ctx: &'a RequestContext,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<Ticket, Rejection>> {
        Box::pin(async move {
            let key = self.key(ctx);
            loop {
                let queue = Arc::clone(
                    &*self
                        .queues
                        .entry(key.clone())
                        .or_insert_with(|| SlotQueue::new(self.limit)),
                );
                match queue.acquire(ctx.priority, deadline).await {
                    Ok(permit) => return Ok(Ticket::Slot(permit)),
                    Err(AcquireError::Timeout) => {
                        return Err(Rejection::timeout(format!("{}:{}", self.name, key)))
                    }
                    Err(AcquireError::Retired) => {
                        self.queues.remove_if(&key, |_, q| Arc::ptr_eq(q, &queue));
                    }
                }
            }
        })
    }

    fn stats(&self) -> ControllerStats {
        let (running, waiting) = self.queues.iter().fold((0, 0), |(r, w), q| {
            (r + q.value().running(), w + q.value().waiting())
        });
        ControllerStats {
            name: self.name.clone(),
            limit: self.limit as u64,
            running,
            waiting,
            keys: self.queues.len(),
        }
    }

    fn prune(&self, idle: Duration) {
        let before = self.queues.len();
        self.queues.retain(|_, q| !q.retire_if_idle(idle));
        let dropped = before.saturating_sub(self.queues.len());
        if dropped > 0 {
            tracing::debug!(controller = %self.name, dropped, "Dropped idle queues");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ows::OwsRequest;

    fn ctx(ip: &str, user: &str) -> RequestContext {
        RequestContext::new(
            OwsRequest::new("wms", Some("getmap"), Some("image/png")),
            ip.parse().unwrap(),
            user,
        )
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(30)
    }

    #[tokio::test]
    async fn ows_controller_applies_to_matching_requests_only() {
        let c = ConcurrencyController::new(
            Selector::Ows(OwsMatcher::parse("wms.getmap").unwrap()),
            1,
        );
        assert_eq!(c.name(), "ows.wms.getmap");
        assert!(c.applies(&ctx("10.0.0.1", "a")));

        let mut other = ctx("10.0.0.1", "a");
        other.ows = OwsRequest::new("wfs", Some("getfeature"), None);
        assert!(!c.applies(&other));
    }

    #[tokio::test]
    async fn concurrency_controller_times_out_when_full() {
        let c = ConcurrencyController::global(1);
        let first = c.admit(&ctx("10.0.0.1", "a"), soon()).await.unwrap();
        let err = c.admit(&ctx("10.0.0.2", "b"), soon()).await.unwrap_err();
        assert!(matches!(err, Rejection::Timeout { ref controller, .. } if controller == "global"));

        drop(first);
        assert!(c.admit(&ctx("10.0.0.2", "b"), soon()).await.is_ok());
    }

    #[tokio::test]
    async fn keyed_controller_isolates_keys() {
        let c = KeyedController::per_user(1);
        let _alice = c.admit(&ctx("10.0.0.1", "alice"), soon()).await.unwrap();
        assert!(c.admit(&ctx("10.0.0.1", "bob"), soon()).await.is_ok());
        assert!(c.admit(&ctx("10.0.0.2", "alice"), soon()).await.is_err());
        assert_eq!(c.stats().keys, 2);
    }

    #[tokio::test]
    async fn ip_controller_skips_excluded_addresses() {
        let excluded: HashSet<IpAddr> = ["192.168.1.8".parse().unwrap()].into_iter().collect();
        let c = KeyedController::per_ip(1, excluded);
        assert!(!c.applies(&ctx("192.168.1.8", "a")));
        assert!(c.applies(&ctx("192.168.1.9", "a")));
    }

    #[tokio::test]
    async fn prune_drops_idle_queues_and_recreates_on_demand() {
        let c = KeyedController::per_ip(1, HashSet::new());
        let held = c.admit(&ctx("10.0.0.1", "a"), soon()).await.unwrap();
        drop(c.admit(&ctx("10.0.0.2", "a"), soon()).await.unwrap());

        c.prune(Duration::ZERO);
        // The busy queue survives.
        assert_eq!(c.stats().keys, 1);
        assert_eq!(c.stats().running, 1);

        drop(held);
        c.prune(Duration::ZERO);
        assert_eq!(c.stats().keys, 0);
        assert!(c.admit(&ctx("10.0.0.1", "a"), soon()).await.is_ok());
    }
}
