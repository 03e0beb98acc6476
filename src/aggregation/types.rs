use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for an aggregation job (128-bit UUID v4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

macro_rules! lowercase_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(from = "String")]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: &str) -> Self {
                Self(raw.trim().to_lowercase())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }

        // Wire input goes through the same normalization as `new`.
        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self::new(&raw)
            }
        }
    };
}

lowercase_id!(
    /// Wallet address being aggregated, lower-cased for keying.
    Account
);
lowercase_id!(
    /// Chain identifier such as `eth` or `arbitrum`.
    ChainId
);
lowercase_id!(
    /// Data provider identifier such as `aave-v3` or `token-balances`.
    ProviderId
);

/// Normalizes a requested chain list: lower case, de-duplicated, sorted.
pub fn normalize_chains<S: AsRef<str>>(chains: &[S]) -> Vec<ChainId> {
    chains
        .iter()
        .map(|chain| ChainId::new(chain.as_ref()))
        .filter(|chain| !chain.0.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Key of the active-job pointer for an account and chain set.
pub fn active_job_key(account: &Account, chains: &[ChainId]) -> String {
    let chains: Vec<&str> = chains.iter().map(ChainId::as_str).collect();
    format!("{}|{}", account, chains.join(","))
}

/// One (provider, chain) unit of work inside a job, rendered as `provider:chain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkKey {
    pub provider: ProviderId,
    pub chain: ChainId,
}

impl WorkKey {
    pub fn new(provider: &str, chain: &str) -> Self {
        Self {
            provider: ProviderId::new(provider),
            chain: ChainId::new(chain),
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.chain)
    }
}

impl FromStr for WorkKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, chain) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("Invalid work key '{}', expected provider:chain", s))?;
        if provider.is_empty() || chain.is_empty() {
            return Err(anyhow::anyhow!("Invalid work key '{}'", s));
        }
        Ok(Self::new(provider, chain))
    }
}

/// Terminal outcome of a single work item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WorkOutcome {
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FinalStatus {
    Completed,
    CompletedWithErrors,
    TimedOut,
    Cancelled,
}

impl FinalStatus {
    /// Derives the status of a drained job from its counters.
    pub fn from_counts(succeeded: u32, failed: u32, timed_out: u32, cancelled: u32) -> Self {
        if failed == 0 && timed_out == 0 {
            FinalStatus::Completed
        } else if succeeded == 0 && failed == 0 {
            FinalStatus::TimedOut
        } else if succeeded == 0 && timed_out == 0 && cancelled == failed {
            FinalStatus::Cancelled
        } else {
            FinalStatus::CompletedWithErrors
        }
    }
}

/// Externally visible job status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Running,
    Completed,
    CompletedWithErrors,
    TimedOut,
    Cancelled,
}

impl From<FinalStatus> for JobStatus {
    fn from(status: FinalStatus) -> Self {
        match status {
            FinalStatus::Completed => JobStatus::Completed,
            FinalStatus::CompletedWithErrors => JobStatus::CompletedWithErrors,
            FinalStatus::TimedOut => JobStatus::TimedOut,
            FinalStatus::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Lifecycle of a job.
///
/// `Finalized` doubles as the "final event emitted" flag: it is entered exactly once and
/// never left. The only change allowed afterwards is the straggler upgrade to `Completed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum JobState {
    Running,
    #[serde(rename_all = "camelCase")]
    Finalized {
        status: FinalStatus,
        finalized_at: u64,
    },
}

impl JobState {
    pub fn is_finalized(&self) -> bool {
        matches!(self, JobState::Finalized { .. })
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Running => JobStatus::Running,
            JobState::Finalized { status, .. } => (*status).into(),
        }
    }

    /// Compare-and-swap `Running -> Finalized`. Returns `false` if already finalized.
    pub fn finalize(&mut self, status: FinalStatus, at: u64) -> bool {
        match self {
            JobState::Running => {
                *self = JobState::Finalized {
                    status,
                    finalized_at: at,
                };
                true
            }
            JobState::Finalized { .. } => false,
        }
    }

    /// Upgrades a `TimedOut`/`CompletedWithErrors` job to `Completed`, keeping the
    /// original finalization time.
    pub fn upgrade_to_completed(&mut self) -> bool {
        match self {
            JobState::Finalized { status, .. }
                if matches!(
                    *status,
                    FinalStatus::TimedOut | FinalStatus::CompletedWithErrors
                ) =>
            {
                *status = FinalStatus::Completed;
                true
            }
            _ => false,
        }
    }
}

/// Counters and lifecycle state of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    pub job_id: JobId,
    pub account: Account,
    pub chains: Vec<ChainId>,
    pub created_at: u64,
    pub expected_total: u32,
    pub succeeded: u32,
    /// Includes cancelled work items.
    pub failed: u32,
    pub timed_out: u32,
    /// Subset of `failed` that were cancelled upstream.
    pub cancelled: u32,
    pub processed: u32,
    pub state: JobState,
}

impl JobMeta {
    pub fn new(
        job_id: JobId,
        account: Account,
        chains: Vec<ChainId>,
        created_at: u64,
        expected_total: u32,
    ) -> Self {
        Self {
            job_id,
            account,
            chains,
            created_at,
            expected_total,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            cancelled: 0,
            processed: 0,
            state: JobState::Running,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn final_emitted(&self) -> bool {
        self.state.is_finalized()
    }

    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// Counts one newly resolved work item.
    pub fn count(&mut self, outcome: WorkOutcome) {
        self.processed += 1;
        self.add(outcome);
    }

    /// Moves one force-timed-out item to the counter of its real outcome.
    pub fn reclassify_timeout(&mut self, outcome: WorkOutcome) {
        if outcome == WorkOutcome::TimedOut || self.timed_out == 0 {
            return;
        }
        self.timed_out -= 1;
        self.add(outcome);
    }

    fn add(&mut self, outcome: WorkOutcome) {
        match outcome {
            WorkOutcome::Success => self.succeeded += 1,
            WorkOutcome::Failed => self.failed += 1,
            WorkOutcome::Cancelled => {
                self.failed += 1;
                self.cancelled += 1;
            }
            WorkOutcome::TimedOut => self.timed_out += 1,
        }
    }

    pub fn drained_status(&self) -> FinalStatus {
        FinalStatus::from_counts(self.succeeded, self.failed, self.timed_out, self.cancelled)
    }

    /// `succeeded + failed + timed_out == processed <= expected_total`
    pub fn counters_consistent(&self) -> bool {
        self.succeeded + self.failed + self.timed_out == self.processed
            && self.processed <= self.expected_total
    }
}

/// Kind of a normalized wallet item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    Token,
    Supplied,
    Borrowed,
    Liquidity,
    Locked,
}

/// Provider-independent representation of one holding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WalletItem {
    /// The work item this came from (`provider:chain`).
    pub source: String,
    pub provider: ProviderId,
    pub chain: ChainId,
    pub kind: ItemKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Amount in base units, as a decimal string.
    pub amount: String,
    pub decimals: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_at: Option<u64>,
}

/// Items folded in so far plus the work keys they came from. Only ever grows.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedOutput {
    pub items: Vec<WalletItem>,
    pub sources: BTreeSet<String>,
}

impl ConsolidatedOutput {
    /// Appends the items of one work item. A key is folded at most once.
    pub fn fold(&mut self, key: &WorkKey, items: Vec<WalletItem>) -> bool {
        if !self.sources.insert(key.to_string()) {
            return false;
        }
        self.items.extend(items);
        true
    }
}

/// Write-once record of a work item's terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkResult {
    pub outcome: WorkOutcome,
    pub attempt: u32,
    pub started_at: u64,
    pub finished_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Best-known view of a job for polling clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub meta: JobMeta,
    pub status: JobStatus,
    pub pending: Vec<String>,
    pub output: ConsolidatedOutput,
}
