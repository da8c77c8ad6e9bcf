//! The admission gate: runs every applicable controller for a request.

use futures_util::future::poll_immediate;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::schema::FlowConfig;
use crate::flow::controller::{
    ConcurrencyController, ControllerStats, FlowController, KeyedController, Selector, Ticket,
};
use crate::flow::keys::RequestContext;
use crate::flow::ows::{MatcherError, OwsMatcher};
use crate::flow::queue::SlotPermit;
use crate::flow::rate::{RateController, RateRule, RateRuleError};
use crate::flow::{RateHeaders, Rejection};
use crate::observability::metrics;

/// About thirty years; what "never" means for a queue deadline.
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

/// Errors building a gate from configuration.
#[derive(Debug, thiserror::Error)]
pub enum FlowConfigError {
    #[error(transparent)]
    Matcher(#[from] MatcherError),

    #[error(transparent)]
    Rate(#[from] RateRuleError),

    #[error("invalid IP address '{0}'")]
    Ip(String),

    #[error("limit for '{0}' must be at least 1")]
    ZeroLimit(String),
}

#[derive(Debug, Default)]
struct GateCounters {
    running: AtomicUsize,
    blocked: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
}

/// Point-in-time view of the gate.
#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub running: usize,
    pub blocked: usize,
    pub admitted_total: u64,
    pub rejected_total: u64,
    pub timed_out_total: u64,
    pub timeout_secs: u64,
    pub controllers: Vec<ControllerStats>,
}

/// Runs the configured controllers, most restrictive first.
pub struct FlowGate {
    controllers: Vec<Box<dyn FlowController>>,
    timeout: Duration,
    keyed_idle: Duration,
    counters: Arc<GateCounters>,
}

impl FlowGate {
    pub fn new(mut controllers: Vec<Box<dyn FlowController>>, timeout: Duration) -> Self {
        controllers.sort_by_key(|c| c.rank());
        Self {
            controllers,
            timeout,
            keyed_idle: Duration::from_secs(300),
            counters: Arc::new(GateCounters::default()),
        }
    }

    pub fn with_keyed_idle(mut self, idle: Duration) -> Self {
        self.keyed_idle = idle;
        self
    }

    /// Build the controllers described by `config`.
    ///
    /// A disabled config yields a gate that admits everything.
    pub fn from_config(config: &FlowConfig) -> Result<Self, FlowConfigError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let idle = Duration::from_secs(config.keyed_queue_idle_secs);
        if !config.enabled {
            return Ok(Self::new(Vec::new(), timeout).with_keyed_idle(idle));
        }

        fn positive(name: &str, limit: usize) -> Result<usize, FlowConfigError> {
            if limit == 0 {
                Err(FlowConfigError::ZeroLimit(name.to_string()))
            } else {
                Ok(limit)
            }
        }

        let mut controllers: Vec<Box<dyn FlowController>> = Vec::new();

        for rate in &config.rates {
            let matcher = rate.matcher.as_deref().map(OwsMatcher::parse).transpose()?;
            let rule: RateRule = rate.rule.parse()?;
            controllers.push(Box::new(RateController::new(rate.scope, matcher, rule)));
        }

        if let Some(limit) = config.global {
            controllers.push(Box::new(ConcurrencyController::global(positive("global", limit)?)));
        }

        for ows in &config.ows {
            let matcher = OwsMatcher::parse(&ows.matcher)?;
            let limit = positive(&ows.matcher, ows.limit)?;
            controllers.push(Box::new(ConcurrencyController::new(Selector::Ows(matcher), limit)));
        }

        let mut single_ips = HashSet::new();
        for single in &config.single_ip {
            let ip: IpAddr = single
                .ip
                .parse()
                .map_err(|_| FlowConfigError::Ip(single.ip.clone()))?;
            let limit = positive(&single.ip, single.limit)?;
            single_ips.insert(ip);
            controllers.push(Box::new(ConcurrencyController::new(Selector::Ip(ip), limit)));
        }

        if let Some(limit) = config.ip {
            controllers.push(Box::new(KeyedController::per_ip(positive("ip", limit)?, single_ips)));
        }

        if let Some(limit) = config.user {
            controllers.push(Box::new(KeyedController::per_user(positive("user", limit)?)));
        }

        let gate = Self::new(controllers, timeout).with_keyed_idle(idle);
        tracing::info!(
            controllers = ?gate.controllers.iter().map(|c| c.name()).collect::<Vec<_>>(),
            timeout_secs = config.timeout_secs,
            "Flow control configured"
        );
        Ok(gate)
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Admit a request through every controller that applies to it.
    ///
    /// Requests that are not OWS requests pass without holding anything.
    pub async fn admit(&self, ctx: &RequestContext) -> Result<Admission, Rejection> {
        if !ctx.ows.is_ows() || self.controllers.is_empty() {
            return Ok(Admission::pass());
        }

        let deadline = self.deadline();
        let mut admission = Admission::pass();

        for controller in self.controllers.iter().filter(|c| c.applies(ctx)) {
            let mut pending = controller.admit(ctx, deadline);
            let outcome = match poll_immediate(&mut pending).await {
                Some(outcome) => outcome,
                None => {
                    let _blocked = BlockedGuard::enter(&self.counters);
                    pending.await
                }
            };
            match outcome {
                Ok(Ticket::Slot(permit)) => admission.permits.push(permit),
                Ok(Ticket::Rate(headers)) => admission.merge_rate(headers),
                Err(mut rejection) => {
                    if let Rejection::Timeout { rate, .. } = &mut rejection {
                        *rate = admission.rate.take();
                    }
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    if matches!(rejection, Rejection::Timeout { .. }) {
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    }
                    metrics::record_flow_rejection(rejection.reason());
                    tracing::info!(
                        controller = controller.name(),
                        ows = %ctx.ows,
                        client_ip = %ctx.client_ip,
                        error = %rejection,
                        "Request rejected by flow control"
                    );
                    // Dropping `admission` releases what was acquired so far.
                    return Err(rejection);
                }
            }
        }

        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        let running = self.counters.running.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_flow_running(running);
        admission.counters = Some(Arc::clone(&self.counters));
        Ok(admission)
    }

    /// Queue deadline for a request arriving now. Timeouts too large to
    /// represent wait without bound.
    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.timeout)
            .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            running: self.counters.running.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            admitted_total: self.counters.admitted.load(Ordering::Relaxed),
            rejected_total: self.counters.rejected.load(Ordering::Relaxed),
            timed_out_total: self.counters.timed_out.load(Ordering::Relaxed),
            timeout_secs: self.timeout.as_secs(),
            controllers: self.controllers.iter().map(|c| c.stats()).collect(),
        }
    }

    /// Drop idle per-key queues and stale rate windows.
    pub fn prune(&self) {
        for controller in &self.controllers {
            controller.prune(self.keyed_idle);
        }
    }

    /// Prune periodically until shutdown or until the gate is dropped.
    pub fn spawn_janitor(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let gate: Weak<Self> = Arc::downgrade(self);
        let period = (self.keyed_idle / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match gate.upgrade() {
                            Some(gate) => gate.prune(),
                            None => break,
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

struct BlockedGuard<'a>(&'a GateCounters);

impl<'a> BlockedGuard<'a> {
    fn enter(counters: &'a GateCounters) -> Self {
        let blocked = counters.blocked.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_flow_blocked(blocked);
        Self(counters)
    }
}

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        let blocked = self.0.blocked.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::record_flow_blocked(blocked);
    }
}

/// Everything a request acquired on admission.
///
/// Dropping it releases the slots in reverse acquisition order.
#[derive(Debug)]
pub struct Admission {
    permits: Vec<SlotPermit>,
    rate: Option<RateHeaders>,
    counters: Option<Arc<GateCounters>>,
}

impl Admission {
    fn pass() -> Self {
        Self {
            permits: Vec::new(),
            rate: None,
            counters: None,
        }
    }

    /// Keep the tightest rate report.
    fn merge_rate(&mut self, headers: RateHeaders) {
        match &self.rate {
            Some(current) if current.remaining <= headers.remaining => {}
            _ => self.rate = Some(headers),
        }
    }

    pub fn rate_headers(&self) -> Option<&RateHeaders> {
        self.rate.as_ref()
    }

    /// Number of concurrency slots held.
    pub fn slots(&self) -> usize {
        self.permits.len()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        while let Some(permit) = self.permits.pop() {
            drop(permit);
        }
        if let Some(counters) = self.counters.take() {
            let running = counters.running.fetch_sub(1, Ordering::Relaxed) - 1;
            metrics::record_flow_running(running);
        }
    }
}
