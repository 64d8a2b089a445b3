//! Fast lookup of request hashes in front of the durable store.
//!
//! Volatile by nature: an entry may vanish at any time (TTL, capacity), so a
//! miss always falls through to the store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

pub trait HashCache: Send + Sync {
    fn get(&self, tenant_id: &str, key: &str) -> Option<String>;

    fn put(&self, tenant_id: &str, key: &str, request_hash: &str, ttl: Duration);

    fn evict(&self, tenant_id: &str, key: &str);
}

#[derive(Debug)]
struct Entry {
    request_hash: String,
    expires_at: Instant,
    inserted: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<(String, String), Entry>,
    next_seq: u64,
}

/// Bounded TTL cache behind one mutex. When full, expired entries go first,
/// then the oldest insertion.
#[derive(Debug)]
pub struct InMemoryHashCache {
    capacity: usize,
    state: Mutex<State>,
}

impl InMemoryHashCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryHashCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl HashCache for InMemoryHashCache {
    fn get(&self, tenant_id: &str, key: &str) -> Option<String> {
        let mut state = self.lock();
        let id = (tenant_id.to_string(), key.to_string());

        match state.entries.get(&id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.request_hash.clone()),
            Some(_) => {
                state.entries.remove(&id);
                None
            }
            None => None,
        }
    }

    fn put(&self, tenant_id: &str, key: &str, request_hash: &str, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.lock();
        let id = (tenant_id.to_string(), key.to_string());

        if !state.entries.contains_key(&id) && state.entries.len() >= self.capacity {
            state.entries.retain(|_, e| e.expires_at > now);

            if state.entries.len() >= self.capacity {
                let oldest = state
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    state.entries.remove(&oldest);
                }
            }
        }

        let inserted = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            id,
            Entry {
                request_hash: request_hash.to_string(),
                expires_at: now + ttl,
                inserted,
            },
        );
    }

    fn evict(&self, tenant_id: &str, key: &str) {
        self.lock()
            .entries
            .remove(&(tenant_id.to_string(), key.to_string()));
    }
}
