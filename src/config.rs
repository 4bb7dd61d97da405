use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};

/// Which traffic direction the default capture filter focuses on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    /// Packets sourced from a local address.
    Out,
    /// Packets destined to a local address.
    In,
    /// No endpoint clause; capture both directions.
    Both,
}

/// How flows are deduplicated into table keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DedupMode {
    /// Full 5-tuple keys.
    Flow,
    /// Ports zeroed; one key per address pair and protocol.
    Ip,
}

/// Runtime configuration. Every option can come from its long flag or the
/// matching `NETWATCH_*` environment variable; the flag wins.
#[derive(Debug, Parser)]
#[command(name = "netwatch", about = "Host-resident network flow sensor", version)]
pub struct Config {
    /// List network interfaces and exit.
    #[arg(long)]
    pub list_ifaces: bool,

    /// Network interface to capture on (required).
    #[arg(long, env = "NETWATCH_IFACE")]
    pub iface: Option<String>,

    /// Capture direction used when synthesizing the default filter.
    #[arg(long, env = "NETWATCH_DIRECTION", value_enum, default_value = "out")]
    pub direction: Direction,

    /// Explicit capture filter expression. When empty, a default is
    /// synthesized from the direction and the interface's local IPv4s.
    #[arg(long, env = "NETWATCH_FILTER")]
    pub filter: Option<String>,

    /// pcap snapshot length in bytes.
    #[arg(long, env = "NETWATCH_SNAPLEN", default_value_t = 1600)]
    pub snaplen: i32,

    /// Enable promiscuous mode.
    #[arg(
        long,
        env = "NETWATCH_PROMISC",
        default_value_t = true,
        action = clap::ArgAction::Set,
    )]
    pub promisc: bool,

    /// Flush interval for flow export.
    #[arg(
        long = "flush",
        env = "NETWATCH_FLUSH",
        value_parser = humantime::parse_duration,
        default_value = "5s",
    )]
    pub flush_interval: Duration,

    /// Maximum connections per HTTP batch.
    #[arg(long, env = "NETWATCH_MAX_BATCH_CONNS", default_value_t = 200)]
    pub max_batch_conns: usize,

    /// Maximum serialized JSON payload size per batch, in bytes. Zero
    /// disables the bound.
    #[arg(long, env = "NETWATCH_MAX_BATCH_BYTES", default_value_t = 1_500_000)]
    pub max_batch_bytes: usize,

    /// Collector base URL.
    #[arg(
        long = "backend",
        env = "NETWATCH_BACKEND_URL",
        default_value = "http://localhost:4000",
    )]
    pub backend_url: String,

    /// HTTP request timeout.
    #[arg(
        long,
        env = "NETWATCH_HTTP_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "5s",
    )]
    pub http_timeout: Duration,

    /// Tenant identifier sent with every request.
    #[arg(long, env = "NETWATCH_TENANT_ID", default_value = "default")]
    pub tenant_id: String,

    /// Bearer token for collector authentication.
    #[arg(long, env = "NETWATCH_AUTH_TOKEN", default_value = "")]
    pub auth_token: String,

    /// Stable host identifier mixed into flow ids so the collector can
    /// tell identical flows on different machines apart.
    #[arg(long, env = "NETWATCH_HOST_ID", default_value = "")]
    pub host_id: String,

    /// Flow deduplication mode.
    #[arg(
        long = "dedup",
        env = "NETWATCH_DEDUP_MODE",
        value_enum,
        default_value = "flow",
    )]
    pub dedup_mode: DedupMode,

    /// Flows idle longer than this are marked inactive; past twice this
    /// they are dropped. Zero disables pruning.
    #[arg(
        long,
        env = "NETWATCH_IDLE_TTL",
        value_parser = humantime::parse_duration,
        default_value = "2m",
    )]
    pub idle_ttl: Duration,

    /// How often interface metrics snapshots are taken and posted.
    #[arg(
        long,
        env = "NETWATCH_METRICS_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "60s",
    )]
    pub metrics_interval: Duration,

    /// Logging verbosity (trace, debug, info, warn, error).
    #[arg(long, env = "NETWATCH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validates the configuration for an agent run. `--list-ifaces` does
    /// not need an interface; everything else does.
    pub fn validate(&self) -> Result<()> {
        if self.list_ifaces {
            return Ok(());
        }

        if self.iface.as_deref().unwrap_or("").is_empty() {
            bail!("--iface is required");
        }

        if self.snaplen <= 0 {
            bail!("--snaplen must be positive");
        }

        if self.flush_interval.is_zero() {
            bail!("--flush must be positive");
        }

        if self.max_batch_conns == 0 {
            bail!("--max-batch-conns must be positive");
        }

        if self.http_timeout.is_zero() {
            bail!("--http-timeout must be positive");
        }

        if self.metrics_interval.is_zero() {
            bail!("--metrics-interval must be positive");
        }

        Ok(())
    }
}
