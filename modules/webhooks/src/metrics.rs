use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

#[derive(Clone)]
pub struct WebhookMetrics {
    /// Latency of successful deliveries
    pub delivery_duration_seconds: HistogramVec,
    /// outcome: success|retry|dlq
    pub deliveries_total: IntCounterVec,
}

impl WebhookMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let delivery_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "webhook_delivery_duration_seconds",
                "Webhook delivery latency in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["tenant_id"],
        )?;

        let deliveries_total = IntCounterVec::new(
            Opts::new("webhook_deliveries_total", "Webhook delivery outcomes"),
            &["outcome"],
        )?;

        registry.register(Box::new(delivery_duration_seconds.clone()))?;
        registry.register(Box::new(deliveries_total.clone()))?;

        Ok(Self {
            delivery_duration_seconds,
            deliveries_total,
        })
    }
}
