//! Handler-level duplicate detection.
//!
//! Remembers event ids for a TTL so a handler can skip an event it already
//! applied recently. Advisory only: after the TTL (or a restart) a repeat is
//! processed again, so the handler's mutation must tolerate rare duplicates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct IdempotencyTracker {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
    shutdown: CancellationToken,
}

impl IdempotencyTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record `event_id` and report whether it was already seen inside the TTL
    pub fn seen_before(&self, event_id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.lock();

        match seen.get(event_id) {
            Some(expires_at) if *expires_at > now => true,
            _ => {
                seen.insert(event_id.to_string(), now + self.ttl);
                false
            }
        }
    }

    /// Drop an id so its next delivery is processed again
    pub fn forget(&self, event_id: &str) {
        self.lock().remove(event_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired ids, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.lock();
        let before = seen.len();
        seen.retain(|_, expires_at| *expires_at > now);
        before - seen.len()
    }

    /// Sweep expired ids every `interval` until [`IdempotencyTracker::stop`]
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = tracker.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = tracker.len(), "Idempotency tracker sweep");
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
