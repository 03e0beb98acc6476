//! Runtime configuration.
//!
//! Options come from the command line or `AGGREGATOR_*` environment variables and are
//! normalized into an `AggregatorConfig`, which clamps every bound into its safe range.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

pub const SWEEP_INTERVAL_BOUNDS: (u64, u64) = (5, 300);
pub const JOB_TIMEOUT_BOUNDS: (u64, u64) = (30, 3600);

fn clamp_secs(secs: u64, (min, max): (u64, u64)) -> Duration {
    Duration::from_secs(secs.clamp(min, max))
}

/// Tunables of the aggregation pipeline.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How often the timeout sweeper runs.
    pub sweep_interval: Duration,
    /// Age after which a running job is force-finalized as timed out.
    pub job_timeout: Duration,
    /// Lifetime of all keys of a job.
    pub job_ttl: Duration,
    /// Provider attempts per work item, including the first.
    pub max_attempts: u32,
    /// Delay before attempt `n + 1`, indexed by `n - 1`; the last entry repeats.
    pub retry_delays: Vec<Duration>,
    /// Upper bound on a single provider call.
    pub provider_timeout: Duration,
    /// Expansion is refused when the job expires sooner than this.
    pub expansion_ttl_margin: Duration,
    pub request_workers: usize,
    pub result_workers: usize,
    pub lease: Duration,
    pub max_deliveries: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(15),
            job_timeout: Duration::from_secs(120),
            job_ttl: Duration::from_secs(900),
            max_attempts: 3,
            retry_delays: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
            ],
            provider_timeout: Duration::from_secs(30),
            expansion_ttl_margin: Duration::from_secs(30),
            request_workers: 8,
            result_workers: 4,
            lease: Duration::from_secs(30),
            max_deliveries: 5,
        }
    }
}

impl AggregatorConfig {
    /// Applies the clamps and cross-field constraints.
    ///
    /// The job TTL always outlives the timeout window plus two sweeps and the expansion
    /// margin, so the sweeper gets to finalize a job before its keys vanish.
    pub fn normalized(mut self) -> Self {
        self.sweep_interval = clamp_secs(self.sweep_interval.as_secs(), SWEEP_INTERVAL_BOUNDS);
        self.job_timeout = clamp_secs(self.job_timeout.as_secs(), JOB_TIMEOUT_BOUNDS);
        self.max_attempts = self.max_attempts.max(1);
        self.max_deliveries = self.max_deliveries.max(1);
        self.request_workers = self.request_workers.max(1);
        self.result_workers = self.result_workers.max(1);

        let floor = self.job_timeout + self.sweep_interval * 2 + self.expansion_ttl_margin;
        if self.job_ttl < floor {
            tracing::warn!(
                "Job TTL {:?} is shorter than the timeout window, raising it to {:?}",
                self.job_ttl,
                floor
            );
            self.job_ttl = floor;
        }

        self
    }

    /// Delay before re-running a work item whose attempt number `attempt` just failed.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.retry_delays
            .get(index)
            .or_else(|| self.retry_delays.last())
            .copied()
            .unwrap_or_default()
    }
}

/// An HTTP provider endpoint given as `NAME=URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub name: String,
    pub url: String,
}

fn parse_provider_endpoint(raw: &str) -> Result<ProviderEndpoint, String> {
    let (name, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=URL, got '{}'", raw))?;
    let (name, url) = (name.trim(), url.trim());
    if name.is_empty() || url.is_empty() {
        return Err(format!("expected NAME=URL, got '{}'", raw));
    }
    Ok(ProviderEndpoint {
        name: name.to_string(),
        url: url.to_string(),
    })
}

/// Command line of the aggregation node.
#[derive(Debug, Parser)]
#[command(name = "wallet-aggregator", version, about = "Wallet holdings aggregation node")]
pub struct Cli {
    /// Address of the HTTP API.
    #[arg(long, env = "AGGREGATOR_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Sweeper period in seconds (clamped to 5..=300).
    #[arg(long, env = "AGGREGATOR_SWEEP_INTERVAL_SECS", default_value_t = 15)]
    pub sweep_interval_secs: u64,

    /// Job timeout in seconds (clamped to 30..=3600).
    #[arg(long, env = "AGGREGATOR_JOB_TIMEOUT_SECS", default_value_t = 120)]
    pub job_timeout_secs: u64,

    #[arg(long, env = "AGGREGATOR_JOB_TTL_SECS", default_value_t = 900)]
    pub job_ttl_secs: u64,

    #[arg(long, env = "AGGREGATOR_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Comma-separated retry delays in seconds, one per failed attempt.
    #[arg(
        long,
        env = "AGGREGATOR_RETRY_DELAYS_SECS",
        value_delimiter = ',',
        default_values_t = [5u64, 15, 45]
    )]
    pub retry_delays_secs: Vec<u64>,

    #[arg(long, env = "AGGREGATOR_PROVIDER_TIMEOUT_SECS", default_value_t = 30)]
    pub provider_timeout_secs: u64,

    #[arg(long, env = "AGGREGATOR_EXPANSION_MARGIN_SECS", default_value_t = 30)]
    pub expansion_margin_secs: u64,

    #[arg(long, env = "AGGREGATOR_REQUEST_WORKERS", default_value_t = 8)]
    pub request_workers: usize,

    #[arg(long, env = "AGGREGATOR_RESULT_WORKERS", default_value_t = 4)]
    pub result_workers: usize,

    #[arg(long, env = "AGGREGATOR_LEASE_SECS", default_value_t = 30)]
    pub lease_secs: u64,

    #[arg(long, env = "AGGREGATOR_MAX_DELIVERIES", default_value_t = 5)]
    pub max_deliveries: u32,

    /// HTTP provider endpoint, `NAME=URL`. Repeatable.
    #[arg(long = "provider", value_parser = parse_provider_endpoint)]
    pub providers: Vec<ProviderEndpoint>,
}

impl Cli {
    pub fn config(&self) -> AggregatorConfig {
        AggregatorConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            job_ttl: Duration::from_secs(self.job_ttl_secs),
            max_attempts: self.max_attempts,
            retry_delays: self
                .retry_delays_secs
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            provider_timeout: Duration::from_secs(self.provider_timeout_secs),
            expansion_ttl_margin: Duration::from_secs(self.expansion_margin_secs),
            request_workers: self.request_workers,
            result_workers: self.result_workers,
            lease: Duration::from_secs(self.lease_secs),
            max_deliveries: self.max_deliveries,
        }
        .normalized()
    }
}
