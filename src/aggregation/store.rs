//! Job Store
//!
//! Holds job metadata, the pending work set, per-work-item results, the active-job
//! pointers and the per-account recency index, all TTL-bound.
//!
//! ## Atomicity
//! A job's counters, pending/swept sets, consolidated output and lifecycle state live in
//! ONE record. Every multi-field change (resolve a work item, sweep, expand, finalize)
//! runs inside a single `TtlMap::update` closure, i.e. under that job's key lock. Two
//! writers can therefore never both observe "pending is empty" and both finalize:
//! whichever runs second sees `JobState::Finalized` and backs off.

use super::types::*;
use crate::storage::{TtlMap, now_ms};

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Newest entries kept per account in the recency index.
pub const RECENT_JOBS_CAP: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("job {0} not found or expired")]
    JobNotFound(JobId),
    #[error("job {0} is already finalized")]
    JobFinalized(JobId),
    #[error("job {0} expires in {1:?}, too soon to take more work")]
    ExpiringSoon(JobId, Duration),
}

/// Key of a write-once result record: `(job, provider, chain)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey {
    pub job_id: JobId,
    pub work_key: WorkKey,
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job_id, self.work_key)
    }
}

#[derive(Debug, Clone)]
struct JobRecord {
    meta: JobMeta,
    /// Work items not yet resolved.
    pending: BTreeSet<WorkKey>,
    /// Work items the sweeper counted as timed out.
    swept: BTreeSet<WorkKey>,
    /// Every work item ever enqueued for the job.
    known: BTreeSet<WorkKey>,
    output: ConsolidatedOutput,
}

impl JobRecord {
    fn try_finalize(&mut self, now: u64) -> Option<JobMeta> {
        if !self.pending.is_empty() {
            return None;
        }
        let status = self.meta.drained_status();
        self.meta
            .state
            .finalize(status, now)
            .then(|| self.meta.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecentEntry {
    created_at: u64,
    job_id: JobId,
}

/// Result of `create_or_reuse`.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub job_id: JobId,
    /// `false` when an in-flight job was returned instead.
    pub created: bool,
    pub meta: JobMeta,
}

/// A job the sweeper finalized as timed out.
#[derive(Debug, Clone)]
pub struct SweptJob {
    pub meta: JobMeta,
    /// Pending items this sweep counted as timed out.
    pub swept: u32,
}

/// What `resolve_work_item` did with a result.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The item left the pending set and was counted. Carries the job's meta if this
    /// result drained the job and finalized it.
    Counted { finalized: Option<JobMeta> },
    /// A straggler for an item the sweeper already counted as timed out.
    Reclassified { upgraded: bool },
    /// The item was neither pending nor swept; nothing changed.
    Ignored,
}

pub struct JobStore {
    jobs: TtlMap<JobId, JobRecord>,
    results: TtlMap<ResultKey, WorkResult>,
    active: TtlMap<String, JobId>,
    recent: TtlMap<Account, Vec<RecentEntry>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: TtlMap::new(),
            results: TtlMap::new(),
            active: TtlMap::new(),
            recent: TtlMap::new(),
        }
    }

    /// Returns the in-flight job for `(account, chains)` or creates a new one.
    ///
    /// The pointer is checked and set under its key lock, so concurrent duplicate starts
    /// coalesce into one job.
    pub fn create_or_reuse(
        &self,
        account: &Account,
        chains: &[ChainId],
        work_items: Vec<WorkKey>,
        ttl: Duration,
    ) -> CreateOutcome {
        self.active
            .compute(active_job_key(account, chains), ttl, |current| {
                // A pointer to an expired job counts as absent.
                if let Some(job_id) = current
                    && let Some(meta) = self.get_meta(job_id)
                {
                    tracing::debug!("Reusing in-flight job {} for {}", job_id, account);
                    let reused = CreateOutcome {
                        job_id: *job_id,
                        created: false,
                        meta,
                    };
                    return (None, reused);
                }

                let job_id = JobId::new();
                let meta = self.insert_job(job_id, account, chains, work_items, ttl);
                let created = CreateOutcome {
                    job_id,
                    created: true,
                    meta,
                };
                (Some(job_id), created)
            })
    }

    fn insert_job(
        &self,
        job_id: JobId,
        account: &Account,
        chains: &[ChainId],
        work_items: Vec<WorkKey>,
        ttl: Duration,
    ) -> JobMeta {
        let now = now_ms();
        let pending: BTreeSet<WorkKey> = work_items.into_iter().collect();
        let meta = JobMeta::new(
            job_id,
            account.clone(),
            chains.to_vec(),
            now,
            pending.len() as u32,
        );

        self.jobs.insert(
            job_id,
            JobRecord {
                meta: meta.clone(),
                known: pending.clone(),
                pending,
                swept: BTreeSet::new(),
                output: ConsolidatedOutput::default(),
            },
            ttl,
        );

        self.recent.compute(account.clone(), ttl, |current| {
            let mut entries = current.cloned().unwrap_or_default();
            entries.insert(
                0,
                RecentEntry {
                    created_at: now,
                    job_id,
                },
            );
            entries.truncate(RECENT_JOBS_CAP);
            (Some(entries), ())
        });

        tracing::info!(
            "Created job {} for {} with {} work items",
            job_id,
            account,
            meta.expected_total
        );

        meta
    }

    pub fn get_meta(&self, job_id: &JobId) -> Option<JobMeta> {
        self.jobs.get(job_id).map(|record| record.meta)
    }

    /// Best-known view for polling: counters, pending keys and partial output.
    pub fn snapshot(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.jobs.get(job_id).map(|record| JobSnapshot {
            status: record.meta.status(),
            pending: record.pending.iter().map(ToString::to_string).collect(),
            meta: record.meta,
            output: record.output,
        })
    }

    pub fn pending_keys(&self, job_id: &JobId) -> Option<Vec<WorkKey>> {
        self.jobs
            .get(job_id)
            .map(|record| record.pending.into_iter().collect())
    }

    /// Remaining lifetime of the job's keys.
    pub fn job_ttl(&self, job_id: &JobId) -> Option<Duration> {
        self.jobs.ttl_remaining(job_id)
    }

    /// Writes a work item's result only if none exists yet.
    ///
    /// Returns `true` the first time; `false` means a duplicate delivery.
    pub fn record_result(
        &self,
        job_id: &JobId,
        work_key: &WorkKey,
        result: WorkResult,
        ttl: Duration,
    ) -> bool {
        let key = ResultKey {
            job_id: *job_id,
            work_key: work_key.clone(),
        };
        self.results.insert_if_absent(key, result, ttl)
    }

    pub fn get_result(&self, job_id: &JobId, work_key: &WorkKey) -> Option<WorkResult> {
        self.results.get(&ResultKey {
            job_id: *job_id,
            work_key: work_key.clone(),
        })
    }

    /// Removes the item from pending, bumps the matching counter, folds its items into
    /// the consolidated output and finalizes the job if pending drained. One atomic unit.
    pub fn resolve_work_item(
        &self,
        job_id: &JobId,
        work_key: &WorkKey,
        outcome: WorkOutcome,
        items: Vec<WalletItem>,
    ) -> Result<Resolution, StoreError> {
        let now = now_ms();

        self.jobs
            .update(job_id, |record| {
                // Regular result
                if record.pending.remove(work_key) {
                    record.meta.count(outcome);
                    record.output.fold(work_key, items);
                    Resolution::Counted {
                        finalized: record.try_finalize(now),
                    }
                } else if record.swept.remove(work_key) {
                    // Late result for an item the sweeper already counted
                    record.meta.reclassify_timeout(outcome);
                    record.output.fold(work_key, items);
                    let clean = record.meta.failed == 0 && record.meta.timed_out == 0;
                    Resolution::Reclassified {
                        upgraded: clean && record.meta.state.upgrade_to_completed(),
                    }
                } else {
                    Resolution::Ignored
                }
            })
            .ok_or(StoreError::JobNotFound(*job_id))
    }

    /// Finalizes a running job whose pending set is already empty.
    pub fn finalize_if_drained(&self, job_id: &JobId) -> Result<Option<JobMeta>, StoreError> {
        let now = now_ms();
        self.jobs
            .update(job_id, |record| record.try_finalize(now))
            .ok_or(StoreError::JobNotFound(*job_id))
    }

    /// Running jobs older than `timeout`.
    pub fn stale_jobs(&self, now: u64, timeout: Duration) -> Vec<JobId> {
        let timeout_ms = timeout.as_millis() as u64;
        self.jobs
            .live_keys()
            .into_iter()
            .filter(|job_id| {
                self.get_meta(job_id)
                    .map(|meta| !meta.final_emitted() && meta.age_ms(now) > timeout_ms)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// The sweeper's timeout transition: every pending item is counted as timed out and
    /// the job is finalized as `TimedOut`.
    ///
    /// Re-checks state and age under the job lock; returns `None` if the job is gone,
    /// already finalized, or not old enough.
    pub fn sweep_job(&self, job_id: &JobId, now: u64, timeout: Duration) -> Option<SweptJob> {
        let timeout_ms = timeout.as_millis() as u64;

        self.jobs
            .update(job_id, |record| {
                if record.meta.final_emitted() || record.meta.age_ms(now) <= timeout_ms {
                    return None;
                }

                // Move what is still pending into the swept set so stragglers can be
                // reclassified later.
                let pending = std::mem::take(&mut record.pending);
                let swept = pending.len() as u32;
                record.meta.timed_out += swept;
                record.meta.processed += swept;
                record.swept.extend(pending);

                record
                    .meta
                    .state
                    .finalize(FinalStatus::TimedOut, now)
                    .then(|| SweptJob {
                        meta: record.meta.clone(),
                        swept,
                    })
            })
            .flatten()
    }

    /// Adds work items to a running job, skipping any the job already knows.
    ///
    /// Fails if the job is gone, finalized, or expires within `ttl_margin`. Returns the
    /// keys that were actually added.
    pub fn expand(
        &self,
        job_id: &JobId,
        candidates: Vec<WorkKey>,
        ttl_margin: Duration,
    ) -> Result<Vec<WorkKey>, StoreError> {
        self.jobs
            .update_with_ttl(job_id, |record, remaining| {
                if record.meta.final_emitted() {
                    return Err(StoreError::JobFinalized(*job_id));
                }
                if remaining < ttl_margin {
                    return Err(StoreError::ExpiringSoon(*job_id, remaining));
                }

                // `known` covers resolved items too, so nothing runs twice
                let added: Vec<WorkKey> = candidates
                    .into_iter()
                    .filter(|key| record.known.insert(key.clone()))
                    .collect();

                record.pending.extend(added.iter().cloned());
                record.meta.expected_total += added.len() as u32;
                Ok(added)
            })
            .unwrap_or(Err(StoreError::JobNotFound(*job_id)))
    }

    /// Clears the active-job pointer if it still points at this job.
    pub fn clear_active_pointer(&self, meta: &JobMeta) -> bool {
        let pointer = active_job_key(&meta.account, &meta.chains);
        self.active.remove_if(&pointer, |job_id| *job_id == meta.job_id)
    }

    pub fn active_job(&self, account: &Account, chains: &[ChainId]) -> Option<JobId> {
        self.active.get(&active_job_key(account, chains))
    }

    /// Most recent live jobs of an account, newest first.
    pub fn list_recent_jobs(&self, account: &Account, limit: usize) -> Vec<JobMeta> {
        let mut entries = self.recent.get(account).unwrap_or_default();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        entries
            .iter()
            .filter_map(|entry| self.get_meta(&entry.job_id))
            .take(limit)
            .collect()
    }

    /// Physically drops expired keys. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.jobs.purge_expired()
            + self.results.purge_expired()
            + self.active.purge_expired()
            + self.recent.purge_expired()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.live_count()
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}
