use config_validator::{ConfigBuilder, ConfigError};
use event_bus::consumer_retry::RetryConfig;
use event_consumer::RouterConfig;
use idempotency::IdempotencyConfig;
use outbox::{BackoffPolicy, DispatcherConfig, ShardIndex, TenantPenaltyConfig};
use std::time::Duration;
use webhooks_rs::WebhookWorkerConfig;

const SERVICE: &str = "relay-rs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
    Noop,
}

impl BusType {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "nats" => Some(BusType::Nats),
            "inmemory" => Some(BusType::InMemory),
            "noop" => Some(BusType::Noop),
            _ => None,
        }
    }
}

/// Relay configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
    pub bus_type: BusType,
    pub nats_url: String,
    pub host: String,
    pub port: u16,
    pub dispatcher: DispatcherConfig,
    pub router: RouterConfig,
    /// Subjects fanned out to tenant webhooks; empty disables fan-out
    pub webhook_subjects: Vec<String>,
    pub webhook: WebhookWorkerConfig,
    pub idempotency: IdempotencyConfig,
    pub idempotency_cache_capacity: usize,
    pub handler_dedup_ttl: Duration,
    /// Dispatched outbox rows older than this are pruned
    pub outbox_retention: Duration,
    /// Period of the outbox prune and idempotency purge task
    pub maintenance_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::build(ConfigBuilder::new(SERVICE))
    }

    /// Same as [`Config::from_env`] over an arbitrary key lookup
    pub fn from_source<F>(source: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self::build(ConfigBuilder::from_source(SERVICE, source))
    }

    fn build(mut cfg: ConfigBuilder) -> Result<Self, ConfigError> {
        let database_url = cfg.require("DATABASE_URL");
        let db_max_connections: u32 = cfg.parse_or("DB_MAX_CONNECTIONS", 10);
        let db_acquire_timeout = Duration::from_secs(cfg.parse_or("DB_ACQUIRE_TIMEOUT_SECS", 3));

        let bus = cfg.one_of("BUS_TYPE", "inmemory", &["nats", "inmemory", "noop"]);
        let bus_type = BusType::parse(&bus).unwrap_or(BusType::InMemory);
        let nats_url = cfg.optional("NATS_URL", "nats://localhost:4222");
        let host = cfg.optional("HOST", "0.0.0.0");
        let port: u16 = cfg.parse_or("PORT", 8095);

        let dispatcher = dispatcher_config(&mut cfg);
        let router = router_config(&mut cfg);
        let webhook = webhook_config(&mut cfg);

        let fanout_enabled: bool = cfg.parse_or("WEBHOOK_FANOUT_ENABLED", true);
        let webhook_subjects: Vec<String> = if fanout_enabled {
            cfg.optional("WEBHOOK_SUBJECTS", ">")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let idempotency = IdempotencyConfig {
            cache_ttl: Duration::from_secs(cfg.parse_or("IDEMPOTENCY_CACHE_TTL_SECS", 300)),
            record_ttl: Duration::from_secs(cfg.parse_or("IDEMPOTENCY_RECORD_TTL_SECS", 86_400)),
        };
        let idempotency_cache_capacity: usize = cfg.parse_or("IDEMPOTENCY_CACHE_CAPACITY", 10_000);
        let handler_dedup_ttl = Duration::from_secs(cfg.parse_or("HANDLER_DEDUP_TTL_SECS", 3_600));
        let outbox_retention = Duration::from_secs(cfg.parse_or("OUTBOX_RETENTION_SECS", 604_800));
        let maintenance_interval =
            Duration::from_secs(cfg.parse_or("MAINTENANCE_INTERVAL_SECS", 600));

        cfg.check(db_max_connections > 0, "DB_MAX_CONNECTIONS must be at least 1");
        cfg.check(!outbox_retention.is_zero(), "OUTBOX_RETENTION_SECS must be positive");
        cfg.check(
            !maintenance_interval.is_zero(),
            "MAINTENANCE_INTERVAL_SECS must be positive",
        );
        cfg.check(
            idempotency.record_ttl >= idempotency.cache_ttl,
            "IDEMPOTENCY_RECORD_TTL_SECS must not be shorter than IDEMPOTENCY_CACHE_TTL_SECS",
        );

        cfg.finish()?;

        Ok(Config {
            database_url,
            db_max_connections,
            db_acquire_timeout,
            bus_type,
            nats_url,
            host,
            port,
            dispatcher,
            router,
            webhook_subjects,
            webhook,
            idempotency,
            idempotency_cache_capacity,
            handler_dedup_ttl,
            outbox_retention,
            maintenance_interval,
        })
    }
}

fn millis(cfg: &mut ConfigBuilder, key: &str, default: Duration) -> Duration {
    Duration::from_millis(cfg.parse_or(key, default.as_millis() as u64))
}

fn secs(cfg: &mut ConfigBuilder, key: &str, default: Duration) -> Duration {
    Duration::from_secs(cfg.parse_or(key, default.as_secs()))
}

fn dispatcher_config(cfg: &mut ConfigBuilder) -> DispatcherConfig {
    let defaults = DispatcherConfig::default();
    let penalty = TenantPenaltyConfig::default();

    let poll_interval = millis(cfg, "OUTBOX_POLL_INTERVAL_MS", defaults.poll_interval);
    let batch_limit: usize = cfg.parse_or("OUTBOX_BATCH_LIMIT", defaults.batch_limit);
    let dead_letter_ceiling: u32 =
        cfg.parse_or("OUTBOX_DEAD_LETTER_CEILING", defaults.dead_letter_ceiling);
    let base = millis(cfg, "OUTBOX_BACKOFF_BASE_MS", defaults.backoff.base);
    let max = millis(cfg, "OUTBOX_BACKOFF_MAX_MS", defaults.backoff.max);

    let tenant_penalty = TenantPenaltyConfig {
        threshold: cfg.parse_or("TENANT_FAILURE_THRESHOLD", penalty.threshold),
        window: secs(cfg, "TENANT_FAILURE_WINDOW_SECS", penalty.window),
        penalty: secs(cfg, "TENANT_PENALTY_SECS", penalty.penalty),
    };

    let shard = match (
        cfg.parse_optional::<u32>("OUTBOX_SHARD_INDEX"),
        cfg.parse_optional::<u32>("OUTBOX_SHARD_COUNT"),
    ) {
        (Some(index), Some(count)) => {
            let shard = ShardIndex::new(index, count);
            cfg.check(
                shard.is_some(),
                format!("OUTBOX_SHARD_INDEX {} is out of range for OUTBOX_SHARD_COUNT {}", index, count),
            );
            shard
        }
        (None, None) => None,
        _ => {
            cfg.check(
                false,
                "OUTBOX_SHARD_INDEX and OUTBOX_SHARD_COUNT must be set together",
            );
            None
        }
    };

    cfg.check(poll_interval > Duration::ZERO, "OUTBOX_POLL_INTERVAL_MS must be positive");
    cfg.check(batch_limit > 0, "OUTBOX_BATCH_LIMIT must be at least 1");
    cfg.check(dead_letter_ceiling > 0, "OUTBOX_DEAD_LETTER_CEILING must be at least 1");
    cfg.check(base <= max, "OUTBOX_BACKOFF_BASE_MS must not exceed OUTBOX_BACKOFF_MAX_MS");

    DispatcherConfig {
        poll_interval,
        batch_limit,
        dead_letter_ceiling,
        backoff: BackoffPolicy::new(base, max),
        tenant_penalty,
        shard,
    }
}

fn router_config(cfg: &mut ConfigBuilder) -> RouterConfig {
    let defaults = RouterConfig::default();
    let concurrency: usize = cfg.parse_or("ROUTER_CONCURRENCY", defaults.default_concurrency);
    cfg.check(concurrency > 0, "ROUTER_CONCURRENCY must be at least 1");

    RouterConfig {
        group: cfg.optional("ROUTER_GROUP", &defaults.group),
        default_concurrency: concurrency,
        retry: RetryConfig {
            max_attempts: cfg.parse_or("ROUTER_RETRY_ATTEMPTS", defaults.retry.max_attempts),
            ..defaults.retry
        },
    }
}

fn webhook_config(cfg: &mut ConfigBuilder) -> WebhookWorkerConfig {
    let defaults = WebhookWorkerConfig::default();

    let config = WebhookWorkerConfig {
        poll_interval: millis(cfg, "WEBHOOK_POLL_INTERVAL_MS", defaults.poll_interval),
        batch_limit: cfg.parse_or("WEBHOOK_BATCH_LIMIT", defaults.batch_limit),
        max_retries: cfg.parse_or("WEBHOOK_MAX_RETRIES", defaults.max_retries),
        base_delay: millis(cfg, "WEBHOOK_BASE_DELAY_MS", defaults.base_delay),
        max_delay: millis(cfg, "WEBHOOK_MAX_DELAY_MS", defaults.max_delay),
        http_timeout: millis(cfg, "WEBHOOK_HTTP_TIMEOUT_MS", defaults.http_timeout),
    };

    cfg.check(config.max_retries > 0, "WEBHOOK_MAX_RETRIES must be at least 1");
    cfg.check(
        config.base_delay <= config.max_delay,
        "WEBHOOK_BASE_DELAY_MS must not exceed WEBHOOK_MAX_DELAY_MS",
    );
    cfg.check(
        config.http_timeout > Duration::ZERO,
        "WEBHOOK_HTTP_TIMEOUT_MS must be positive",
    );

    config
}
