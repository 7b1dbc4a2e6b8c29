//! Rate-limited work queue
//!
//! Keys move through `queued -> processing -> done`. A key is never handed to
//! two workers at once: re-adding a key while it is processing marks it dirty
//! and it is queued again when the worker calls [`WorkQueue::done`]. Failed
//! keys are re-added with per-key exponential backoff until
//! [`WorkQueue::forget`] resets their failure count.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::trace;

/// First retry delay for a failing key
pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Upper bound for a failing key's retry delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(1000);

/// Work queue operations used by the state controller
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Queue `key` now
    fn add(&self, key: &str);

    /// Queue `key` once `delay` has elapsed
    fn add_after(&self, key: &str, delay: Duration);

    /// Queue `key` after its per-key backoff and count the requeue
    fn add_rate_limited(&self, key: &str);

    /// Reset the failure count of `key`
    fn forget(&self, key: &str);

    /// Number of rate-limited requeues since the last `forget`
    fn num_requeues(&self, key: &str) -> u32;

    /// Wait for the next key. `None` once the queue is shut down.
    async fn get(&self) -> Option<String>;

    /// Mark `key` as no longer processing
    fn done(&self, key: &str);

    /// Stop handing out keys and wake all waiting workers
    fn shut_down(&self);
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // a poisoned queue still holds consistent sets; keep serving it
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }
}

/// In-process [`WorkQueue`] with per-key exponential backoff
#[derive(Clone)]
pub struct RateLimitingQueue {
    inner: Arc<Inner>,
}

impl Default for RateLimitingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitingQueue {
    /// Queue with the default 5ms..1000s backoff
    pub fn new() -> Self {
        Self::with_backoff(BASE_RETRY_DELAY, MAX_RETRY_DELAY)
    }

    /// Queue with custom backoff bounds
    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// True if no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn backoff_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.inner
            .base_delay
            .checked_mul(factor)
            .map_or(self.inner.max_delay, |d| d.min(self.inner.max_delay))
    }
}

#[async_trait]
impl WorkQueue for RateLimitingQueue {
    fn add(&self, key: &str) {
        self.inner.add(key);
    }

    fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.inner.add(key);
            return;
        }
        if self.inner.lock().shutting_down {
            return;
        }
        let inner = self.inner.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.add(&key);
        });
    }

    fn add_rate_limited(&self, key: &str) {
        let failures = {
            let mut state = self.inner.lock();
            let entry = state.failures.entry(key.to_string()).or_insert(0);
            let current = *entry;
            *entry += 1;
            current
        };
        let delay = self.backoff_for(failures);
        trace!(key, failures, delay_ms = delay.as_millis() as u64, "rate limited requeue");
        self.add_after(key, delay);
    }

    fn forget(&self, key: &str) {
        self.inner.lock().failures.remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.inner.lock().failures.get(key).copied().unwrap_or(0)
    }

    async fn get(&self) -> Option<String> {
        loop {
            // registered before checking so a concurrent add cannot be missed
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn done(&self, key: &str) {
        let mut state = self.inner.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keys_are_deduplicated_while_queued() {
        let q = RateLimitingQueue::new();
        q.add("daemon");
        q.add("daemon");
        q.add("controller");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("daemon"));
        assert_eq!(q.get().await.as_deref(), Some("controller"));
    }

    #[tokio::test]
    async fn re_add_while_processing_is_deferred_until_done() {
        let q = RateLimitingQueue::new();
        q.add("daemon");
        let key = q.get().await.unwrap();

        q.add("daemon");
        assert!(q.is_empty(), "in-flight key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("daemon"));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_waits_for_delay() {
        let q = RateLimitingQueue::new();
        q.add_after("server", Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_requeues_are_counted_until_forget() {
        let q = RateLimitingQueue::with_backoff(Duration::from_millis(1), Duration::from_millis(1));
        q.add_rate_limited("metrics");
        q.add_rate_limited("metrics");
        assert_eq!(q.num_requeues("metrics"), 2);

        q.forget("metrics");
        assert_eq!(q.num_requeues("metrics"), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let q = RateLimitingQueue::new();
        assert_eq!(q.backoff_for(0), Duration::from_millis(5));
        assert_eq!(q.backoff_for(1), Duration::from_millis(10));
        assert_eq!(q.backoff_for(3), Duration::from_millis(40));
        assert_eq!(q.backoff_for(30), MAX_RETRY_DELAY);
        assert_eq!(q.backoff_for(64), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let q = RateLimitingQueue::new();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
