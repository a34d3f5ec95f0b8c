//! Configuration management for the fulfillment service.
//!
//! Every setting is an environment variable (a `.env` file is loaded first)
//! and can be overridden by the matching `--flag`.

use clap::Args;
use fulfillment_core::ledger::StockLevel;
use fulfillment_projections::AnalyticsConfig;
use fulfillment_runtime::{FaultInjection, InventoryConfig, LagWatch, RetryPolicy};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Initial stock levels, written as `item=units` pairs separated by commas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StockSpec(pub Vec<StockLevel>);

impl FromStr for StockSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (item, units) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("expected item=units, got '{pair}'"))?;
                let item = item.trim();
                if item.is_empty() {
                    return Err(format!("empty item name in '{pair}'"));
                }
                let units = units
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| format!("invalid units for '{item}': {e}"))?;
                Ok(StockLevel::new(item, units))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// Service configuration.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Kafka / Redpanda brokers (comma-separated)
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092", global = true)]
    pub kafka_brokers: String,

    /// `PostgreSQL` URL for the ledger and stock (required by `inventory`)
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Maximum connections in the `PostgreSQL` pool
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10, global = true)]
    pub database_max_connections: u32,

    /// Inbound order topic
    #[arg(long, env = "ORDER_TOPIC", default_value = "order.placed", global = true)]
    pub order_topic: String,

    /// Topic for `InventoryReserved`
    #[arg(long, env = "RESERVED_TOPIC", default_value = "inventory.reserved", global = true)]
    pub reserved_topic: String,

    /// Topic for `InventoryFailed`
    #[arg(long, env = "FAILED_TOPIC", default_value = "inventory.failed", global = true)]
    pub failed_topic: String,

    /// Dead-letter topic
    #[arg(long, env = "DLQ_TOPIC", default_value = "order.placed.dlq", global = true)]
    pub dlq_topic: String,

    /// Inventory consumer group
    #[arg(long, env = "INVENTORY_GROUP", default_value = "inventory-service", global = true)]
    pub inventory_group: String,

    /// Analytics consumer group
    #[arg(long, env = "ANALYTICS_GROUP", default_value = "analytics-service", global = true)]
    pub analytics_group: String,

    /// Inventory shard workers
    #[arg(long, env = "INVENTORY_SHARDS", default_value_t = 4, global = true)]
    pub inventory_shards: usize,

    /// Deliveries of one message before it is dead-lettered
    #[arg(long, env = "MAX_DELIVERIES", default_value_t = 5, global = true)]
    pub max_deliveries: u32,

    /// Bound on broker calls, in milliseconds
    #[arg(long, env = "BROKER_TIMEOUT_MS", default_value_t = 5000, global = true)]
    pub broker_timeout_ms: u64,

    /// Bound on ledger and stock calls, in milliseconds
    #[arg(long, env = "DEPENDENCY_TIMEOUT_MS", default_value_t = 2000, global = true)]
    pub dependency_timeout_ms: u64,

    /// How long one poll waits, in milliseconds
    #[arg(long, env = "POLL_TIMEOUT_MS", default_value_t = 1000, global = true)]
    pub poll_timeout_ms: u64,

    /// Latency injected before each reservation, in milliseconds
    #[arg(long, env = "INVENTORY_DELAY_MS", default_value_t = 0, global = true)]
    pub inventory_delay_ms: u64,

    /// Fail every reservation with `forced_failure`
    #[arg(
        long,
        env = "INVENTORY_FAIL_MODE",
        default_value_t = false,
        action = clap::ArgAction::Set,
        global = true
    )]
    pub inventory_fail_mode: bool,

    /// Stock seeded for items that have none yet
    #[arg(
        long,
        env = "INVENTORY_STOCK",
        default_value = "burger=100,pizza=50,sushi=30,salad=200",
        global = true
    )]
    pub inventory_stock: StockSpec,

    /// Analytics report file
    #[arg(
        long,
        env = "ANALYTICS_OUTPUT_FILE",
        default_value = "metrics_report.json",
        global = true
    )]
    pub analytics_output_file: PathBuf,

    /// Events folded between analytics snapshots
    #[arg(long, env = "ANALYTICS_FLUSH_EVERY", default_value_t = 2000, global = true)]
    pub analytics_flush_every: u64,

    /// Period of the lag reporter, in milliseconds
    #[arg(long, env = "LAG_REPORT_INTERVAL_MS", default_value_t = 10_000, global = true)]
    pub lag_report_interval_ms: u64,

    /// Total lag at which the lag command advises throttling
    #[arg(long, env = "LAG_THROTTLE_THRESHOLD", default_value_t = 1000, global = true)]
    pub lag_throttle_threshold: u64,

    /// Address for the Prometheus exporter; disabled when unset
    #[arg(long, env = "METRICS_ADDR", global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Bound on broker calls.
    #[must_use]
    pub const fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    /// Retry policy for broker calls, each attempt bounded by the broker timeout.
    #[must_use]
    pub fn broker_retry(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .attempt_timeout(self.broker_timeout())
            .build()
    }

    /// Inventory consumer settings.
    #[must_use]
    pub fn inventory(&self) -> InventoryConfig {
        InventoryConfig {
            order_topic: self.order_topic.clone(),
            reserved_topic: self.reserved_topic.clone(),
            failed_topic: self.failed_topic.clone(),
            dlq_topic: self.dlq_topic.clone(),
            consumer_group: self.inventory_group.clone(),
            shards: self.inventory_shards.max(1),
            max_deliveries: self.max_deliveries.max(1),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            dependency_timeout: Duration::from_millis(self.dependency_timeout_ms),
            broker_retry: self.broker_retry(),
        }
    }

    /// Analytics consumer settings. It folds orders and both outcome topics.
    #[must_use]
    pub fn analytics(&self) -> AnalyticsConfig {
        AnalyticsConfig {
            topics: self.analytics_topics(),
            consumer_group: self.analytics_group.clone(),
            flush_every: self.analytics_flush_every.max(1),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            broker_retry: self.broker_retry(),
            ..AnalyticsConfig::default()
        }
    }

    /// Topics consumed by the analytics group.
    #[must_use]
    pub fn analytics_topics(&self) -> Vec<String> {
        vec![
            self.order_topic.clone(),
            self.reserved_topic.clone(),
            self.failed_topic.clone(),
        ]
    }

    /// Both consumer groups with the topics they read.
    #[must_use]
    pub fn lag_watches(&self) -> Vec<LagWatch> {
        vec![
            LagWatch::new(self.inventory_group.clone(), vec![self.order_topic.clone()]),
            LagWatch::new(self.analytics_group.clone(), self.analytics_topics()),
        ]
    }

    /// Topics read by `group`, if it is one of the configured groups.
    #[must_use]
    pub fn topics_of(&self, group: &str) -> Option<Vec<String>> {
        self.lag_watches()
            .into_iter()
            .find(|watch| watch.consumer_group == group)
            .map(|watch| watch.topics)
    }

    /// Fault injection read at startup.
    #[must_use]
    pub const fn faults(&self) -> FaultInjection {
        FaultInjection::new(self.inventory_delay_ms, self.inventory_fail_mode)
    }

    /// Period of the lag reporter.
    #[must_use]
    pub const fn lag_report_interval(&self) -> Duration {
        Duration::from_millis(self.lag_report_interval_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: Config,
    }

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["fulfillment"];
        argv.extend_from_slice(args);
        Harness::try_parse_from(argv).unwrap().config
    }

    #[test]
    fn stock_spec_parses_pairs() {
        let stock: StockSpec = "burger=100, pizza=50,,sushi = 30".parse().unwrap();
        assert_eq!(
            stock.0,
            vec![
                StockLevel::new("burger", 100),
                StockLevel::new("pizza", 50),
                StockLevel::new("sushi", 30),
            ]
        );
    }

    #[test]
    fn stock_spec_rejects_malformed_pairs() {
        assert!("burger".parse::<StockSpec>().is_err());
        assert!("=5".parse::<StockSpec>().is_err());
        assert!("burger=-1".parse::<StockSpec>().is_err());
        assert!("".parse::<StockSpec>().unwrap().0.is_empty());
    }

    #[test]
    fn flags_shape_consumer_settings() {
        let config = parse(&[
            "--inventory-shards",
            "8",
            "--max-deliveries",
            "3",
            "--dependency-timeout-ms",
            "250",
            "--inventory-fail-mode",
            "true",
            "--inventory-delay-ms",
            "40",
            "--order-topic",
            "orders",
        ]);

        let inventory = config.inventory();
        assert_eq!(inventory.shards, 8);
        assert_eq!(inventory.max_deliveries, 3);
        assert_eq!(inventory.dependency_timeout, Duration::from_millis(250));
        assert_eq!(inventory.order_topic, "orders");
        assert_eq!(config.faults(), FaultInjection::new(40, true));
        assert_eq!(config.analytics().topics[0], "orders");
        assert_eq!(config.topics_of("inventory-service"), Some(vec!["orders".to_string()]));
        assert_eq!(config.topics_of("billing"), None);
    }

    #[test]
    fn zero_shards_and_budget_are_clamped() {
        let config = parse(&["--inventory-shards", "0", "--max-deliveries", "0"]);
        assert_eq!(config.inventory().shards, 1);
        assert_eq!(config.inventory().max_deliveries, 1);
    }

    #[test]
    fn bad_stock_flag_is_a_parse_error() {
        assert!(Harness::try_parse_from(["fulfillment", "--inventory-stock", "burger:5"]).is_err());
    }
}
