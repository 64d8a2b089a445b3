use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

#[derive(Clone)]
pub struct OutboxMetrics {
    pub published_total: IntCounter,
    pub publish_failures_total: IntCounterVec,
    pub dead_lettered_total: IntCounter,
}

impl OutboxMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published_total = IntCounter::with_opts(Opts::new(
            "outbox_published_total",
            "Outbox records published to the bus",
        ))?;

        let publish_failures_total = IntCounterVec::new(
            Opts::new("outbox_publish_failures_total", "Failed outbox publish attempts"),
            &["tenant_id"],
        )?;

        let dead_lettered_total = IntCounter::with_opts(Opts::new(
            "outbox_dead_lettered_total",
            "Outbox records moved to dead_letter",
        ))?;

        registry.register(Box::new(published_total.clone()))?;
        registry.register(Box::new(publish_failures_total.clone()))?;
        registry.register(Box::new(dead_lettered_total.clone()))?;

        Ok(Self {
            published_total,
            publish_failures_total,
            dead_lettered_total,
        })
    }
}
