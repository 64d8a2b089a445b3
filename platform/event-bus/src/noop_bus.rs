//! Bus that logs publishes and delivers nothing
//!
//! Used by deployments that run the dispatcher without a transport yet, and
//! by tests that only care that publishing succeeded.

use crate::{BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct NoopBus {
    published: Arc<AtomicU64>,
}

impl NoopBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages accepted so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventBus for NoopBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(subject = %subject, bytes = payload.len(), "NoopBus publish");
        Ok(())
    }

    async fn subscribe(&self, _subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        Ok(stream::pending().boxed())
    }

    async fn queue_subscribe(
        &self,
        _subject: &str,
        _group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        Ok(stream::pending().boxed())
    }

    async fn close(&self) -> BusResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_bus_counts_publishes() {
        let bus = NoopBus::new();
        bus.publish("a.b", b"1".to_vec()).await.unwrap();
        bus.publish("a.c", b"2".to_vec()).await.unwrap();
        assert_eq!(bus.published(), 2);

        let mut stream = bus.subscribe("a.>").await.unwrap();
        let next =
            tokio::time::timeout(std::time::Duration::from_millis(50), stream.next()).await;
        assert!(next.is_err());
    }
}
