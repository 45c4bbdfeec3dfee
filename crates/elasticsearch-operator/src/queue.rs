//! Rate-limited work queue
//!
//! A set-backed FIFO of reconciliation keys:
//!
//! - **Deduplication**: adding a key that is already pending is a no-op, so a
//!   burst of events for one cluster collapses into a single reconciliation.
//! - **In-flight exclusivity**: a key handed out by [`WorkQueue::get`] is not
//!   handed out again until [`WorkQueue::done`] is called. Re-adds while it is
//!   in flight are parked and delivered once after `done`.
//! - **Delayed and rate-limited adds**: failed keys come back after a delay
//!   chosen by a [`RateLimiter`]; [`WorkQueue::forget`] resets the backoff.
//! - **Shutdown**: no new keys are accepted and delayed adds are dropped;
//!   pending keys are still handed out, then `get` returns `None`.

use crate::rate_limit::{default_controller_rate_limiter, RateLimiter};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

struct QueueState<T> {
    /// Keys ready to be handed out, in order
    queue: VecDeque<T>,
    /// Keys that need processing (queued, or re-added while in flight)
    dirty: HashSet<T>,
    /// Keys currently held by a worker
    processing: HashSet<T>,
    /// Keys waiting for a delayed add, with their due time
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

/// Deduplicating, rate-limited work queue
pub struct WorkQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    /// Signalled when a key becomes available or on shutdown
    available: Notify,
    /// Signalled when the last in-flight key is done
    idle: Notify,
    /// Signalled on shutdown; releases pending delayed adds
    stopped: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a queue using the given rate limiter for failed keys
    pub fn new(name: &'static str, rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                shutting_down: false,
            }),
            available: Notify::new(),
            idle: Notify::new(),
            stopped: Notify::new(),
            rate_limiter: Box::new(rate_limiter),
        }
    }

    /// Create a queue with the default controller rate limiter
    pub fn with_default_rate_limiter(name: &'static str) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // delivered again by `done`
            return;
        }
        state.queue.push_back(item);
        self.record_depth(state.queue.len());
        metrics::counter!("elasticsearch_operator_workqueue_adds_total", "name" => self.name)
            .increment(1);
        drop(state);
        self.available.notify_one();
    }

    /// Add `item` once `delay` has elapsed.
    ///
    /// If the item is already waiting, the earlier due time wins.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let due = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            if matches!(state.waiting.get(&item), Some(existing) if *existing <= due) {
                return;
            }
            state.waiting.insert(item.clone(), due);
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let stopped = queue.stopped.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();
            if queue.is_shutting_down() {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(due) => {}
                _ = &mut stopped => return,
            }
            let still_due = {
                let mut state = queue.state.lock();
                if state.waiting.get(&item) == Some(&due) {
                    state.waiting.remove(&item);
                    true
                } else {
                    false
                }
            };
            if still_due {
                queue.add(item);
            }
        });
    }

    /// Add `item` after the delay chosen by the rate limiter
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.rate_limiter.when(&item);
        metrics::counter!("elasticsearch_operator_workqueue_retries_total", "name" => self.name)
            .increment(1);
        trace!(queue = self.name, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        self.add_after(item, delay);
    }

    /// Clear the failure history of `item`
    pub fn forget(&self, item: &T) {
        self.rate_limiter.forget(item);
    }

    /// Number of rate-limited requeues of `item` since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shut down and no items remain. Every
    /// `Some` must be answered with exactly one [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    self.record_depth(state.queue.len());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release an item obtained from [`WorkQueue::get`]
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);

        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.record_depth(state.queue.len());
            drop(state);
            self.available.notify_one();
            return;
        }

        if state.processing.is_empty() {
            drop(state);
            self.idle.notify_waiters();
        }
    }

    /// Stop accepting new items, drop pending delayed adds and wake every
    /// blocked `get`
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.available.notify_waiters();
        self.stopped.notify_waiters();
    }

    /// Shut down, then wait until no item is held by a worker
    pub async fn shutdown_with_drain(&self) {
        self.shutdown();
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of items ready to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_depth(&self, depth: usize) {
        metrics::gauge!("elasticsearch_operator_workqueue_depth", "name" => self.name)
            .set(depth as f64);
    }
}
