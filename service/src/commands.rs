//! Subcommand implementations.

use crate::config::Config;
use crate::{LagArgs, ResetArgs};
use anyhow::{Context, Result};
use fulfillment_core::event_bus::{EventBus, OffsetAdmin, OffsetResetRequest};
use fulfillment_postgres::PostgresInventoryStore;
use fulfillment_projections::{AnalyticsAggregates, AnalyticsConsumer, FileSnapshotStore};
use fulfillment_redpanda::RedpandaEventBus;
use fulfillment_runtime::{
    FaultSwitch, InventoryConsumer, LagMonitor, LagReport, LagWatch, ThrottleAdvice,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

fn event_bus(config: &Config) -> Result<Arc<RedpandaEventBus>> {
    let bus = RedpandaEventBus::builder()
        .brokers(&config.kafka_brokers)
        .timeout(config.broker_timeout())
        .build()
        .context("Failed to create event bus")?;
    Ok(Arc::new(bus))
}

fn lag_monitor(config: &Config, bus: &Arc<RedpandaEventBus>) -> LagMonitor {
    LagMonitor::new(Arc::clone(bus) as Arc<dyn OffsetAdmin>).with_retry(config.broker_retry())
}

fn analytics_consumer(config: &Config, bus: &Arc<RedpandaEventBus>) -> AnalyticsConsumer {
    let snapshots = FileSnapshotStore::new(config.analytics_output_file.clone());
    AnalyticsConsumer::new(
        Arc::clone(bus) as Arc<dyn EventBus>,
        Arc::new(snapshots),
        config.analytics(),
    )
}

fn log_report(aggregates: &AnalyticsAggregates, config: &Config) {
    info!(
        total_orders = aggregates.total_orders,
        total_reserved = aggregates.total_reserved,
        total_failed = aggregates.total_failed,
        failure_rate = aggregates.failure_rate,
        invalid_events = aggregates.invalid_events,
        report = %config.analytics_output_file.display(),
        "Analytics report written"
    );
}

/// Run the inventory reservation consumer until `shutdown`.
///
/// Also reports lag of both groups every `LAG_REPORT_INTERVAL_MS`.
///
/// # Errors
///
/// Fails if `DATABASE_URL` is missing, the database or broker cannot be
/// reached, or the consumer stops on a fatal error.
pub async fn inventory(config: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for the inventory consumer")?;

    info!("Connecting to inventory database...");
    let store = PostgresInventoryStore::connect(database_url, config.database_max_connections)
        .await
        .context("Failed to connect to inventory database")?;
    store.migrate().await.context("Failed to run migrations")?;
    let seeded = store
        .seed_stock(config.inventory_stock.0.clone())
        .await
        .context("Failed to seed stock")?;
    info!(seeded, "Inventory database ready");

    let bus = event_bus(config)?;

    let monitor = lag_monitor(config, &bus);
    let (watches, interval, reporter_shutdown) =
        (config.lag_watches(), config.lag_report_interval(), shutdown.clone());
    let reporter = tokio::spawn(async move {
        monitor.run_reporter(watches, interval, reporter_shutdown).await;
    });

    let consumer = InventoryConsumer::new(
        Arc::clone(&bus) as Arc<dyn EventBus>,
        Arc::new(store),
        config.inventory(),
    )
    .with_faults(FaultSwitch::new(config.faults()));
    let outcome = consumer.run(shutdown).await;
    reporter.abort();

    let stats = outcome.context("Inventory consumer stopped")?;
    info!(
        reserved = stats.reserved,
        failed = stats.failed,
        duplicates = stats.duplicates,
        dead_lettered = stats.dead_lettered,
        redelivered = stats.redelivered,
        "Inventory consumer finished"
    );
    Ok(())
}

/// Run the analytics consumer until `shutdown`, resuming from its report.
///
/// # Errors
///
/// Fails if the broker cannot be reached or the report cannot be written.
pub async fn analytics(config: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let bus = event_bus(config)?;
    let aggregates = analytics_consumer(config, &bus)
        .run(shutdown)
        .await
        .context("Analytics consumer stopped")?;
    log_report(&aggregates, config);
    Ok(())
}

/// Rebuild the analytics report from the start of every topic.
///
/// # Errors
///
/// Fails if the analytics group is still running elsewhere, or for the
/// reasons [`analytics`] fails.
pub async fn replay_analytics(config: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let bus = event_bus(config)?;
    info!(consumer_group = %config.analytics_group, "Replaying analytics from earliest offsets");
    let aggregates = analytics_consumer(config, &bus)
        .replay(bus.as_ref(), shutdown)
        .await
        .context("Analytics replay stopped")?;
    log_report(&aggregates, config);
    Ok(())
}

/// Topics named on the command line, else the topics `group` is known to read.
fn topics_for(config: &Config, group: &str, explicit: &[String]) -> Result<Vec<String>> {
    if !explicit.is_empty() {
        return Ok(explicit.to_vec());
    }
    config
        .topics_of(group)
        .with_context(|| format!("unknown consumer group '{group}'; pass --topics"))
}

/// What `reset-offsets` does for a given group and target.
#[derive(Debug, PartialEq, Eq)]
enum ResetPlan {
    /// Rewind every analytics topic and discard the snapshot with it;
    /// otherwise the snapshot would skip everything the group re-reads
    Analytics,
    /// Move offsets only
    Offsets(OffsetResetRequest),
}

fn plan_reset(config: &Config, args: &ResetArgs) -> Result<ResetPlan> {
    let topics = topics_for(config, &args.group, &args.topics)?;
    let target = OffsetResetTarget::from(args.target);
    if args.group != config.analytics_group || target != OffsetResetTarget::Earliest {
        return Ok(ResetPlan::Offsets(OffsetResetRequest {
            consumer_group: args.group.clone(),
            topics,
            target,
        }));
    }

    let mut requested = topics;
    let mut all = config.analytics_topics();
    requested.sort();
    all.sort();
    anyhow::ensure!(
        requested == all,
        "'{}' rewinds all of {all:?} together; omit --topics or use replay-analytics",
        args.group
    );
    Ok(ResetPlan::Analytics)
}

/// Move a stopped group's committed offsets.
///
/// Rewinding the analytics group to earliest also discards its snapshot, so
/// the next run rebuilds the report.
///
/// # Errors
///
/// Fails if the group is active or the broker rejects the commit.
pub async fn reset_offsets(config: &Config, args: &ResetArgs) -> Result<()> {
    let bus = event_bus(config)?;
    match plan_reset(config, args)? {
        ResetPlan::Analytics => analytics_consumer(config, &bus)
            .reset(bus.as_ref())
            .await
            .with_context(|| format!("Failed to reset '{}'", args.group))?,
        ResetPlan::Offsets(request) => bus
            .reset_offsets(request)
            .await
            .with_context(|| format!("Failed to reset offsets of '{}'", args.group))?,
    }
    Ok(())
}

fn lag_json(report: &LagReport, advice: ThrottleAdvice, threshold: u64) -> serde_json::Value {
    serde_json::json!({
        "consumer_group": report.consumer_group,
        "total_lag": report.total(),
        "drained": report.is_drained(),
        "throttle": matches!(advice, ThrottleAdvice::Throttle { .. }),
        "throttle_threshold": threshold,
        "partitions": report.partitions,
    })
}

/// Print lag of one or both groups as JSON.
///
/// # Errors
///
/// Fails if offsets cannot be read, or if `--wait-secs` elapses before
/// the lag reaches zero.
pub async fn lag(config: &Config, args: &LagArgs) -> Result<()> {
    let bus = event_bus(config)?;
    let monitor = lag_monitor(config, &bus);
    let watches = match &args.group {
        Some(group) => vec![LagWatch::new(group.clone(), topics_for(config, group, &args.topics)?)],
        None => config.lag_watches(),
    };

    let mut reports = Vec::with_capacity(watches.len());
    for watch in &watches {
        let report = match args.wait_secs {
            Some(secs) => {
                monitor
                    .wait_for_drain(
                        &watch.consumer_group,
                        &watch.topics,
                        Duration::from_secs(secs),
                        Duration::from_millis(500),
                    )
                    .await?
            },
            None => monitor.report(&watch.consumer_group, &watch.topics).await?,
        };
        let advice = monitor
            .throttle_advice(&watch.consumer_group, &watch.topics, config.lag_throttle_threshold)
            .await?;
        reports.push(lag_json(&report, advice, config.lag_throttle_threshold));
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ResetTarget;
    use fulfillment_core::event_bus::PartitionLag;

    fn parse_config() -> Config {
        use clap::Parser;

        #[derive(Parser)]
        struct Harness {
            #[command(flatten)]
            config: Config,
        }
        Harness::try_parse_from(["fulfillment"]).unwrap().config
    }

    fn reset(group: &str, topics: &[&str], target: ResetTarget) -> ResetArgs {
        ResetArgs {
            group: group.to_string(),
            topics: topics.iter().map(ToString::to_string).collect(),
            target,
        }
    }

    #[test]
    fn analytics_rewind_discards_the_snapshot() {
        let config = parse_config();

        let rewind = reset("analytics-service", &[], ResetTarget::Earliest);
        assert_eq!(plan_reset(&config, &rewind).unwrap(), ResetPlan::Analytics);

        let reordered = reset(
            "analytics-service",
            &["inventory.failed", "order.placed", "inventory.reserved"],
            ResetTarget::Earliest,
        );
        assert_eq!(plan_reset(&config, &reordered).unwrap(), ResetPlan::Analytics);
    }

    #[test]
    fn partial_analytics_rewind_is_refused() {
        let config = parse_config();
        let partial = reset("analytics-service", &["order.placed"], ResetTarget::Earliest);
        assert!(plan_reset(&config, &partial).is_err());
    }

    #[test]
    fn other_resets_only_move_offsets() {
        let config = parse_config();

        let skip = reset("analytics-service", &[], ResetTarget::Latest);
        let ResetPlan::Offsets(request) = plan_reset(&config, &skip).unwrap() else {
            panic!("expected an offset move");
        };
        assert_eq!(request.target, OffsetResetTarget::Latest);
        assert_eq!(request.topics, config.analytics_topics());

        let inventory = reset("inventory-service", &[], ResetTarget::Earliest);
        assert_eq!(
            plan_reset(&config, &inventory).unwrap(),
            ResetPlan::Offsets(OffsetResetRequest {
                consumer_group: "inventory-service".to_string(),
                topics: vec!["order.placed".to_string()],
                target: OffsetResetTarget::Earliest,
            })
        );
    }

    #[test]
    fn lag_json_shape() {
        let report = LagReport {
            consumer_group: "inventory-service".to_string(),
            partitions: vec![
                PartitionLag::from_watermarks(
                    "inventory-service",
                    "order.placed",
                    0,
                    Some(10),
                    0,
                    15,
                ),
                PartitionLag::from_watermarks("inventory-service", "order.placed", 1, None, 0, 3),
            ],
        };

        let json = lag_json(&report, ThrottleAdvice::Proceed, 1000);

        assert_eq!(json["total_lag"], 8);
        assert_eq!(json["drained"], false);
        assert_eq!(json["throttle"], false);
        assert_eq!(json["partitions"][1]["lag"], 3);
        assert!(json["partitions"][1]["committed"].is_null());
    }
}
