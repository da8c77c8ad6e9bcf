//! Bounded concurrency slots with a priority wait queue.
//!
//! A [`SlotQueue`] lets `capacity` requests run at once. Further requests
//! wait, highest priority first and FIFO within a priority, until a slot is
//! handed to them or their deadline passes. Slots are handed over directly
//! from the releasing permit to the next waiter, so a released slot can never
//! be stolen by a newcomer while others are queued.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Why a slot could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("deadline passed while waiting for a slot")]
    Timeout,
    /// The queue was retired after going idle; look up a fresh one.
    #[error("queue retired")]
    Retired,
}

struct Waiter {
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence (older) first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    running: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
    last_activity: Instant,
    retired: bool,
}

/// A fixed number of concurrency slots shared by one request category.
pub struct SlotQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for SlotQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotQueue")
            .field("capacity", &self.capacity)
            .field("running", &self.running())
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl SlotQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(QueueState {
                running: 0,
                waiters: BinaryHeap::new(),
                next_seq: 0,
                last_activity: Instant::now(),
                retired: false,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Number of requests waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Acquire a slot, waiting until `deadline` at most.
    ///
    /// A free slot is taken immediately even when the deadline already passed.
    /// Dropping the returned future while it waits removes the waiter.
    pub async fn acquire(
        self: &Arc<Self>,
        priority: i32,
        deadline: Instant,
    ) -> Result<SlotPermit, AcquireError> {
        let (seq, rx) = {
            let mut state = self.state.lock();
            if state.retired {
                return Err(AcquireError::Retired);
            }
            state.last_activity = Instant::now();
            if state.running < self.capacity {
                state.running += 1;
                return Ok(SlotPermit {
                    queue: Arc::clone(self),
                });
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter { priority, seq, tx });
            (seq, rx)
        };

        let mut pending = PendingWaiter {
            queue: Arc::clone(self),
            seq,
            rx,
            granted: false,
        };

        let outcome = tokio::time::timeout_at(deadline, &mut pending.rx).await;
        match outcome {
            Ok(Ok(())) => Ok(pending.into_permit()),
            Ok(Err(_)) => Err(AcquireError::Timeout),
            Err(_) => {
                // A hand-off may have landed right at the deadline.
                if pending.rx.try_recv().is_ok() {
                    Ok(pending.into_permit())
                } else {
                    Err(AcquireError::Timeout)
                }
            }
        }
    }

    /// Retire the queue if nothing ran or waited on it for `idle`.
    ///
    /// Returns true when the queue is (now) retired.
    pub fn retire_if_idle(&self, idle: Duration) -> bool {
        let mut state = self.state.lock();
        if state.retired {
            return true;
        }
        if state.running == 0 && state.waiters.is_empty() && state.last_activity.elapsed() >= idle {
            state.retired = true;
        }
        state.retired
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        while let Some(waiter) = state.waiters.pop() {
            if waiter.tx.send(()).is_ok() {
                // Slot passes to the waiter; the running count is unchanged.
                return;
            }
        }
        state.running = state.running.saturating_sub(1);
    }

    fn abandon(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.seq != seq);
        state.waiters.len() != before
    }
}

/// Cleans up after a waiter that stops waiting for any reason.
struct PendingWaiter {
    queue: Arc<SlotQueue>,
    seq: u64,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl PendingWaiter {
    fn into_permit(mut self) -> SlotPermit {
        self.granted = true;
        SlotPermit {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        // Not in the heap any more means a slot was already handed to us.
        if !self.queue.abandon(self.seq) {
            self.queue.release();
        }
    }
}

/// A held slot. Dropping it releases the slot to the next waiter.
#[derive(Debug)]
pub struct SlotPermit {
    queue: Arc<SlotQueue>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.queue.release();
    }
}
