use crate::config::{BusType, Config};
use event_bus::{BusError, EventBus, InMemoryBus, NatsBus, NoopBus};
use std::sync::Arc;

/// Build the bus selected by `BUS_TYPE`
pub async fn connect_bus(config: &Config) -> Result<Arc<dyn EventBus>, BusError> {
    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
        BusType::Noop => {
            tracing::warn!("Using no-op event bus; published events are only logged");
            Arc::new(NoopBus::new())
        }
        BusType::Nats => {
            tracing::info!(nats_url = %config.nats_url, "Connecting to NATS");
            let client = async_nats::connect(&config.nats_url)
                .await
                .map_err(|e| BusError::ConnectionError(e.to_string()))?;
            Arc::new(NatsBus::new(client))
        }
    };
    Ok(bus)
}
