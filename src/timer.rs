//! Idle-timeout bookkeeping for long-lived connections.
//!
//! Wraps `tokio_util::time::DelayQueue` the way a background reaper
//! would: callers insert a key with a timeout and reset it on activity;
//! a single task drains expired entries instead of spawning one timer
//! per connection.

use std::collections::HashMap;
use std::time::Duration;
use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;

/// A registry of per-connection idle timers, keyed by an opaque id.
pub struct TimerList<K> {
    queue: DelayQueue<K>,
    keys: HashMap<K, Key>,
    default_timeout: Duration,
}

impl<K: std::hash::Hash + Eq + Clone> TimerList<K> {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            queue: DelayQueue::new(),
            keys: HashMap::new(),
            default_timeout,
        }
    }

    /// Arm or re-arm the timer for `id`, pushing its expiry out by the
    /// default timeout from now.
    pub fn touch(&mut self, id: K) {
        if let Some(key) = self.keys.get(&id) {
            self.queue.reset(key, self.default_timeout);
        } else {
            let key = self.queue.insert(id.clone(), self.default_timeout);
            self.keys.insert(id, key);
        }
    }

    pub fn remove(&mut self, id: &K) {
        if let Some(key) = self.keys.remove(id) {
            self.queue.try_remove(&key);
        }
    }

    /// `DelayQueue::poll_expired` returns `Ready(None)` on an empty
    /// queue rather than `Pending`, so callers must avoid polling it
    /// while empty to not busy-loop; check this first.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Wait for the next timer to expire, returning the id that timed out.
    /// Resolves to `None` if no timers are currently armed.
    pub async fn next_expired(&mut self) -> Option<K> {
        use futures_core_stub::poll_delay_queue;
        poll_delay_queue(&mut self.queue).await.map(|expired| {
            let id = expired.into_inner();
            self.keys.remove(&id);
            id
        })
    }
}

/// `DelayQueue` only exposes a `Stream` impl, not a plain future; this
/// wraps a single `poll_expired` call behind `.await` without pulling
/// in `futures::StreamExt` for one call site.
mod futures_core_stub {
    use std::future::poll_fn;
    use std::task::Poll;
    use tokio_util::time::delay_queue::Expired;
    use tokio_util::time::DelayQueue;

    pub async fn poll_delay_queue<K>(queue: &mut DelayQueue<K>) -> Option<Expired<K>> {
        poll_fn(|cx| match queue.poll_expired(cx) {
            Poll::Ready(v) => Poll::Ready(v),
            Poll::Pending => Poll::Pending,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_touch_and_expire() {
        let mut timers = TimerList::new(Duration::from_millis(20));
        timers.touch(1u32);
        let expired = timers.next_expired().await;
        assert_eq!(expired, Some(1));
    }

    #[tokio::test]
    async fn test_remove_cancels() {
        let mut timers: TimerList<u32> = TimerList::new(Duration::from_millis(50));
        timers.touch(1);
        timers.remove(&1);
        assert!(timers.keys.is_empty());
    }

    #[tokio::test]
    async fn test_touch_resets_existing() {
        let mut timers = TimerList::new(Duration::from_millis(30));
        timers.touch(1u32);
        timers.touch(1u32);
        assert_eq!(timers.keys.len(), 1);
    }
}
