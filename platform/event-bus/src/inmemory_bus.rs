//! In-memory implementation of the EventBus trait for testing and development

use crate::{BusError, BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};

/// EventBus implementation using in-memory channels
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - End-to-end tests that wire the whole delivery pipeline in one process
///
/// Plain subscriptions receive every matching message through a broadcast
/// channel. Queue subscriptions sharing a `(pattern, group)` pair split the
/// matching messages round-robin, one member per message.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
///
/// // Subscribe before publishing
/// let mut stream = bus.subscribe("test.events.>").await?;
///
/// bus.publish("test.events.created", b"hello".to_vec()).await?;
///
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.subject, "test.events.created");
/// assert_eq!(msg.payload, b"hello");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    // None once the bus is closed; dropping the sender ends every stream
    sender: Mutex<Option<broadcast::Sender<BusMessage>>>,
    groups: Mutex<HashMap<(String, String), QueueGroup>>,
}

#[derive(Default)]
struct QueueGroup {
    members: Vec<mpsc::UnboundedSender<BusMessage>>,
    next: usize,
}

impl QueueGroup {
    /// Hand the message to the next live member. Members whose stream was
    /// dropped are pruned on the way.
    fn deliver(&mut self, msg: BusMessage) {
        let mut msg = msg;
        while !self.members.is_empty() {
            let slot = self.next % self.members.len();
            match self.members[slot].send(msg) {
                Ok(()) => {
                    self.next = slot + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.members.remove(slot);
                    msg = returned;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryBus {
    /// Create a new in-memory event bus
    ///
    /// The bus uses a broadcast channel with a buffer of 1000 messages.
    /// If this buffer is exceeded, the oldest messages will be dropped.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new in-memory event bus with a custom buffer size
    ///
    /// # Arguments
    /// * `buffer_size` - The maximum number of messages to buffer before dropping old ones
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                groups: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Check if a subject matches a subscription pattern
    ///
    /// Supports NATS-style wildcards:
    /// - `*` matches exactly one token
    /// - `>` matches one or more tokens
    ///
    /// # Examples
    /// - `auth.events.>` matches `auth.events.user.created`
    /// - `auth.*.created` matches `auth.user.created`
    /// - `auth.events.*` does NOT match `auth.events.user.created` (too many tokens)
    pub fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            match pattern_tokens[p_idx] {
                ">" => return true,
                "*" => {}
                token if token == subject_tokens[s_idx] => {}
                _ => return false,
            }
            s_idx += 1;
            p_idx += 1;
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }

    /// Number of live members in a queue group
    pub fn group_size(&self, pattern: &str, group: &str) -> usize {
        lock(&self.inner.groups)
            .get(&(pattern.to_string(), group.to_string()))
            .map(|g| g.members.iter().filter(|m| !m.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let msg = BusMessage::new(subject.to_string(), payload);

        {
            let sender = lock(&self.inner.sender);
            let sender = sender.as_ref().ok_or(BusError::Closed)?;
            // No plain subscribers is not an error
            let _ = sender.send(msg.clone());
        }

        let mut groups = lock(&self.inner.groups);
        for ((pattern, _), group) in groups.iter_mut() {
            if Self::matches_pattern(subject, pattern) {
                group.deliver(msg.clone());
            }
        }

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = lock(&self.inner.sender)
            .as_ref()
            .ok_or(BusError::Closed)?
            .subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if Self::matches_pattern(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(pattern = %pattern, skipped, "InMemoryBus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        if lock(&self.inner.sender).is_none() {
            return Err(BusError::Closed);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        lock(&self.inner.groups)
            .entry((subject.to_string(), group.to_string()))
            .or_default()
            .members
            .push(tx);

        let stream = async_stream::stream! {
            while let Some(msg) = rx.recv().await {
                yield msg;
            }
        };

        Ok(stream.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        lock(&self.inner.sender).take();
        lock(&self.inner.groups).clear();
        tracing::debug!("InMemoryBus closed");
        Ok(())
    }
}
