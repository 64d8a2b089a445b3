use outbox::OutboxMetrics;
use prometheus::{Encoder, Registry, TextEncoder};
use webhooks_rs::WebhookMetrics;

/// Process-wide registry holding every collector the relay exports
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    pub outbox: OutboxMetrics,
    pub webhooks: WebhookMetrics,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let outbox = OutboxMetrics::register(&registry)?;
        let webhooks = WebhookMetrics::register(&registry)?;
        Ok(Self {
            registry,
            outbox,
            webhooks,
        })
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}
