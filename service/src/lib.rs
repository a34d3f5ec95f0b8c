//! # fulfillment-service
//!
//! The `fulfillment` binary wires the consumers to Redpanda and `PostgreSQL`.
//!
//! ## Commands
//!
//! - `fulfillment inventory` - run the inventory reservation consumer
//! - `fulfillment analytics` - run the analytics consumer
//! - `fulfillment replay-analytics` - reset analytics offsets to earliest,
//!   discard the report and rebuild it from history
//! - `fulfillment reset-offsets` - move a stopped group's offsets; rewinding
//!   the analytics group to earliest also discards its report
//! - `fulfillment lag` - print a JSON lag report, optionally waiting for drain
//!
//! ## Configuration
//!
//! See [`config::Config`]; every flag also reads an environment variable
//! such as `KAFKA_BROKERS` or `DATABASE_URL`.

#![forbid(unsafe_code)]
// The lag command writes its report to stdout
#![allow(clippy::print_stdout)]

pub mod commands;
pub mod config;

use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use fulfillment_core::event_bus::OffsetResetTarget;

/// Order fulfillment consumers and operator tools.
#[derive(Debug, Parser)]
#[command(name = "fulfillment")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Service configuration
    #[command(flatten)]
    pub config: Config,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the inventory reservation consumer until interrupted
    Inventory,

    /// Run the analytics consumer until interrupted
    Analytics,

    /// Reset the analytics group to earliest, discard the report, rebuild it
    ReplayAnalytics,

    /// Move a consumer group's committed offsets (the group must be stopped)
    ResetOffsets(ResetArgs),

    /// Print consumer lag as JSON
    Lag(LagArgs),
}

/// Arguments for `reset-offsets`.
#[derive(Debug, clap::Args)]
pub struct ResetArgs {
    /// Consumer group to move
    #[arg(long)]
    pub group: String,

    /// Topics to reset (comma-separated); defaults to the topics the group reads
    #[arg(long, value_delimiter = ',')]
    pub topics: Vec<String>,

    /// Destination
    #[arg(long, value_enum, default_value_t = ResetTarget::Earliest)]
    pub target: ResetTarget,
}

/// Destination of an offset reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResetTarget {
    /// Reprocess history
    Earliest,
    /// Skip the backlog
    Latest,
}

impl From<ResetTarget> for OffsetResetTarget {
    fn from(target: ResetTarget) -> Self {
        match target {
            ResetTarget::Earliest => Self::Earliest,
            ResetTarget::Latest => Self::Latest,
        }
    }
}

/// Arguments for `lag`.
#[derive(Debug, clap::Args)]
pub struct LagArgs {
    /// Consumer group; both configured groups when omitted
    #[arg(long)]
    pub group: Option<String>,

    /// Topics (comma-separated); defaults to the topics the group reads
    #[arg(long, value_delimiter = ',')]
    pub topics: Vec<String>,

    /// Wait up to this many seconds for lag to reach zero
    #[arg(long)]
    pub wait_secs: Option<u64>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn reset_offsets_parses_topics_and_target() {
        let cli = Cli::try_parse_from([
            "fulfillment",
            "reset-offsets",
            "--group",
            "analytics-service",
            "--topics",
            "order.placed,inventory.reserved",
            "--target",
            "latest",
        ])
        .unwrap();

        let Commands::ResetOffsets(args) = cli.command else {
            panic!("expected reset-offsets");
        };
        assert_eq!(args.group, "analytics-service");
        assert_eq!(args.topics, vec!["order.placed", "inventory.reserved"]);
        assert_eq!(OffsetResetTarget::from(args.target), OffsetResetTarget::Latest);
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "fulfillment",
            "lag",
            "--wait-secs",
            "30",
            "--kafka-brokers",
            "k:9092",
        ])
        .unwrap();

        assert_eq!(cli.config.kafka_brokers, "k:9092");
        let Commands::Lag(args) = cli.command else {
            panic!("expected lag");
        };
        assert_eq!(args.wait_secs, Some(30));
        assert!(args.group.is_none());
    }
}
