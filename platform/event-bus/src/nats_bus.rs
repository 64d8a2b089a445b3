//! NATS-based implementation of the EventBus trait

use crate::{BusError, BusMessage, BusResult, EventBus};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;

/// EventBus implementation backed by core NATS
///
/// Consumer groups map onto NATS queue groups, so replicas of one consumer
/// share the load instead of each seeing every message.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client);
///
/// bus.publish("my.subject", b"hello".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    /// Create a new NatsBus from an already-connected client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect to a NATS server and wrap the client
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        tracing::info!(url = %url, "Connected to NATS");
        Ok(Self::new(client))
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn to_bus_message(nats_msg: async_nats::Message) -> BusMessage {
    let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

    if let Some(reply) = nats_msg.reply {
        msg = msg.with_reply_to(reply.to_string());
    }

    if let Some(nats_headers) = nats_msg.headers {
        let mut headers = HashMap::new();
        for (key, values) in nats_headers.iter() {
            // First value wins
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
        if !headers.is_empty() {
            msg = msg.with_headers(headers);
        }
    }

    msg
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        Ok(subscriber.map(to_bus_message).boxed())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        Ok(subscriber.map(to_bus_message).boxed())
    }

    async fn close(&self) -> BusResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running NATS server:
    // docker run -p 4222:4222 nats:2.10-alpine

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_publish_subscribe() {
        let bus = NatsBus::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let mut stream = bus.subscribe("test.nats.>").await.unwrap();

        let payload = b"test message".to_vec();
        bus.publish("test.nats.hello", payload.clone()).await.unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(msg.subject, "test.nats.hello");
        assert_eq!(msg.payload, payload);
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_queue_group_delivers_once() {
        let bus = NatsBus::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let mut a = bus.queue_subscribe("test.queue.>", "workers").await.unwrap();
        let mut b = bus.queue_subscribe("test.queue.>", "workers").await.unwrap();
        bus.close().await.unwrap();

        bus.publish("test.queue.one", b"x".to_vec()).await.unwrap();
        bus.close().await.unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            tokio::select! {
                m = a.next() => m,
                m = b.next() => m,
            }
        })
        .await
        .expect("timeout waiting for message");
        assert!(first.is_some());

        let second = tokio::time::timeout(std::time::Duration::from_millis(300), async {
            tokio::select! {
                m = a.next() => m,
                m = b.next() => m,
            }
        })
        .await;
        assert!(second.is_err(), "queue group must deliver once");
    }
}
