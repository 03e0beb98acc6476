//! Aggregation Module Tests
//!
//! ## Test Scopes
//! - **Types**: Final status derivation and the job state machine.
//! - **Store**: Coalescing, write-once results, atomic resolution, sweeping, expansion.
//! - **Concurrency**: Counter invariants and single finalization under racing writers.
//! - **Worker**: Retry policy, terminal outcome mapping, provider timeouts.
//! - **Pipeline**: Whole jobs driven through the queue with `Orchestrator::run_until_idle`.

#[cfg(test)]
mod tests {
    use crate::aggregation::aggregator::ResultDisposition;
    use crate::aggregation::orchestrator::Orchestrator;
    use crate::aggregation::protocol::*;
    use crate::aggregation::store::{JobStore, Resolution, StoreError};
    use crate::aggregation::types::*;
    use crate::aggregation::worker::WorkerAction;
    use crate::config::AggregatorConfig;
    use crate::providers::payload::TokenBalance;
    use crate::providers::{
        ProviderError, ProviderPayload, ProviderRegistry, ProviderResponse, StandardMapper,
    };
    use crate::queue::TopicPattern;
    use crate::storage::now_ms;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(600);
    const TIMEOUT: Duration = Duration::from_secs(120);

    fn test_config() -> AggregatorConfig {
        AggregatorConfig {
            retry_delays: vec![Duration::ZERO],
            provider_timeout: Duration::from_millis(200),
            request_workers: 2,
            result_workers: 2,
            ..AggregatorConfig::default()
        }
    }

    fn balances_response() -> ProviderResponse {
        ProviderResponse::new(ProviderPayload::TokenBalances(vec![TokenBalance {
            address: "0xTOKEN".to_string(),
            symbol: "eth".to_string(),
            decimals: 18,
            balance: "100".to_string(),
        }]))
    }

    fn orchestrator_with(setup: impl FnOnce(&Arc<ProviderRegistry>)) -> Orchestrator {
        let registry = ProviderRegistry::new();
        setup(&registry);
        Orchestrator::new(test_config(), registry, Arc::new(StandardMapper))
    }

    fn start_request(account: &str, chains: &[&str]) -> StartAggregationRequest {
        StartAggregationRequest {
            account: account.to_string(),
            chains: chains.iter().map(|c| c.to_string()).collect(),
            providers: None,
        }
    }

    fn completion_events(orchestrator: &Orchestrator) -> Vec<CompletionEvent> {
        orchestrator
            .queue
            .messages_on(&TopicPattern::new(TOPIC_COMPLETED))
            .iter()
            .map(|envelope| envelope.decode().unwrap())
            .collect()
    }

    fn request_for(job_id: JobId, provider: &str, chain: &str, attempt: u32) -> RequestMessage {
        RequestMessage {
            job_id,
            request_id: "req-1".to_string(),
            account: Account::new("0xabc"),
            chains: vec![ChainId::new(chain)],
            chain: ChainId::new(chain),
            provider: ProviderId::new(provider),
            attempt,
            requested_at: now_ms(),
            metadata: Default::default(),
        }
    }

    fn work_result(outcome: WorkOutcome) -> WorkResult {
        WorkResult {
            outcome,
            attempt: 1,
            started_at: 0,
            finished_at: 0,
            error_code: None,
            error_message: None,
            payload: None,
        }
    }

    fn keys(raw: &[&str]) -> Vec<WorkKey> {
        raw.iter().map(|k| k.parse().unwrap()).collect()
    }

    fn new_job(store: &JobStore, items: &[&str]) -> JobId {
        store
            .create_or_reuse(&Account::new("0xabc"), &[ChainId::new("eth")], keys(items), TTL)
            .job_id
    }

    // ============================================================
    // TEST 1: Types - final status and job state
    // ============================================================

    #[test]
    fn test_final_status_from_counts() {
        assert_eq!(FinalStatus::from_counts(3, 0, 0, 0), FinalStatus::Completed);
        assert_eq!(FinalStatus::from_counts(0, 0, 3, 0), FinalStatus::TimedOut);
        assert_eq!(FinalStatus::from_counts(0, 2, 0, 2), FinalStatus::Cancelled);
        assert_eq!(FinalStatus::from_counts(2, 1, 0, 0), FinalStatus::CompletedWithErrors);
        assert_eq!(FinalStatus::from_counts(1, 0, 1, 0), FinalStatus::CompletedWithErrors);
        assert_eq!(FinalStatus::from_counts(0, 2, 0, 1), FinalStatus::CompletedWithErrors);
        // Zero-item job
        assert_eq!(FinalStatus::from_counts(0, 0, 0, 0), FinalStatus::Completed);
    }

    #[test]
    fn test_job_state_finalizes_once() {
        let mut state = JobState::Running;

        assert!(state.finalize(FinalStatus::TimedOut, 10));
        assert!(!state.finalize(FinalStatus::Completed, 20));
        assert_eq!(state.status(), JobStatus::TimedOut);

        assert!(state.upgrade_to_completed());
        assert_eq!(
            state,
            JobState::Finalized {
                status: FinalStatus::Completed,
                finalized_at: 10
            }
        );
        assert!(!state.upgrade_to_completed());
        assert!(!JobState::Running.upgrade_to_completed());
    }

    #[test]
    fn test_work_key_parsing_and_chain_normalization() {
        let key: WorkKey = "Aave-V3:ETH".parse().unwrap();
        assert_eq!(key, WorkKey::new("aave-v3", "eth"));
        assert_eq!(key.to_string(), "aave-v3:eth");
        assert!("no-chain".parse::<WorkKey>().is_err());
        assert!(":eth".parse::<WorkKey>().is_err());

        let chains = normalize_chains(&["Base", "eth", " ETH ", ""]);
        assert_eq!(chains, vec![ChainId::new("base"), ChainId::new("eth")]);
        assert_eq!(active_job_key(&Account::new("0xABC"), &chains), "0xabc|base,eth");
    }

    // ============================================================
    // TEST 2: JobStore
    // ============================================================

    #[test]
    fn test_duplicate_start_reuses_running_job() {
        let store = JobStore::new();
        let account = Account::new("0xabc");
        let chains = [ChainId::new("eth")];

        let first = store.create_or_reuse(&account, &chains, keys(&["p:eth"]), TTL);
        let second = store.create_or_reuse(&account, &chains, keys(&["p:eth", "q:eth"]), TTL);

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.meta.expected_total, 1);
        assert_eq!(store.active_job(&account, &chains), Some(first.job_id));

        // A different chain set is a different job
        let other = store
            .create_or_reuse(&account, &[ChainId::new("base")], keys(&["p:base"]), TTL);
        assert!(other.created);
        assert_ne!(other.job_id, first.job_id);
    }

    #[test]
    fn test_record_result_is_write_once() {
        let store = JobStore::new();
        let job_id = new_job(&store, &["p:eth"]);
        let key = WorkKey::new("p", "eth");

        assert!(store.record_result(&job_id, &key, work_result(WorkOutcome::Success), TTL));
        assert!(!store.record_result(&job_id, &key, work_result(WorkOutcome::Failed), TTL));

        let stored = store.get_result(&job_id, &key).unwrap();
        assert_eq!(stored.outcome, WorkOutcome::Success);
    }

    #[test]
    fn test_three_successes_finalize_completed_once() {
        let store = JobStore::new();
        let job_id = new_job(&store, &["a:eth", "b:eth", "c:eth"]);

        let mut finalizations = 0;
        for key in keys(&["a:eth", "b:eth", "c:eth"]) {
            match store
                .resolve_work_item(&job_id, &key, WorkOutcome::Success, vec![])
                .unwrap()
            {
                Resolution::Counted { finalized: Some(meta) } => {
                    finalizations += 1;
                    assert_eq!(meta.status(), JobStatus::Completed);
                }
                Resolution::Counted { finalized: None } => {}
                other => panic!("Unexpected resolution: {:?}", other),
            }
        }

        // Re-resolving a counted item changes nothing
        let again = store
            .resolve_work_item(&job_id, &WorkKey::new("a", "eth"), WorkOutcome::Failed, vec![])
            .unwrap();
        assert_eq!(again, Resolution::Ignored);

        let meta = store.get_meta(&job_id).unwrap();
        assert_eq!(finalizations, 1);
        assert_eq!(meta.succeeded, 3);
        assert_eq!(meta.processed, 3);
        assert!(meta.counters_consistent());
    }

    #[test]
    fn test_mixed_outcomes_keep_counter_invariant() {
        let store = JobStore::new();
        let job_id = new_job(&store, &["a:eth", "b:eth", "c:eth", "d:eth"]);

        let outcomes = [
            ("a:eth", WorkOutcome::Success),
            ("b:eth", WorkOutcome::Failed),
            ("c:eth", WorkOutcome::Cancelled),
        ];
        for (key, outcome) in outcomes {
            store
                .resolve_work_item(&job_id, &key.parse().unwrap(), outcome, vec![])
                .unwrap();
            assert!(store.get_meta(&job_id).unwrap().counters_consistent());
        }

        let meta = store.get_meta(&job_id).unwrap();
        assert_eq!(meta.status(), JobStatus::Running);
        assert_eq!((meta.succeeded, meta.failed, meta.cancelled), (1, 2, 1));

        let resolution = store
            .resolve_work_item(&job_id, &WorkKey::new("d", "eth"), WorkOutcome::TimedOut, vec![])
            .unwrap();
        let Resolution::Counted { finalized: Some(meta) } = resolution else {
            panic!("Job should have finalized");
        };
        assert_eq!(meta.status(), JobStatus::CompletedWithErrors);
        assert!(meta.counters_consistent());
    }

    #[test]
    fn test_all_cancelled_job_is_cancelled() {
        let store = JobStore::new();
        let job_id = new_job(&store, &["a:eth", "b:eth"]);

        for key in keys(&["a:eth", "b:eth"]) {
            store
                .resolve_work_item(&job_id, &key, WorkOutcome::Cancelled, vec![])
                .unwrap();
        }

        assert_eq!(store.get_meta(&job_id).unwrap().status(), JobStatus::Cancelled);
    }

    #[test]
    fn test_unknown_job_is_not_resurrected() {
        let store = JobStore::new();
        let ghost = JobId::new();

        let result = store.resolve_work_item(&ghost, &WorkKey::new("p", "eth"), WorkOutcome::Success, vec![]);

        assert_eq!(result, Err(StoreError::JobNotFound(ghost)));
        assert!(store.get_meta(&ghost).is_none());
        assert_eq!(store.finalize_if_drained(&ghost), Err(StoreError::JobNotFound(ghost)));
    }

    #[test]
    fn test_sweeper_transition_times_out_pending_items() {
        let store = JobStore::new();
        let job_id = new_job(&store, &["a:eth", "b:eth", "c:eth"]);
        let created_at = store.get_meta(&job_id).unwrap().created_at;

        // Not stale yet
        assert!(store.stale_jobs(created_at + 1_000, TIMEOUT).is_empty());
        assert!(store.sweep_job(&job_id, created_at + 1_000, TIMEOUT).is_none());

        let later = created_at + TIMEOUT.as_millis() as u64 + 1;
        assert_eq!(store.stale_jobs(later, TIMEOUT), vec![job_id]);

        let swept = store.sweep_job(&job_id, later, TIMEOUT).unwrap();
        assert_eq!(swept.swept, 3);
        let meta = swept.meta;
        assert_eq!(meta.status(), JobStatus::TimedOut);
        assert_eq!(meta.timed_out, 3);
        assert_eq!(meta.processed, 3);
        assert!(meta.counters_consistent());
        assert!(store.pending_keys(&job_id).unwrap().is_empty());

        // Second sweep is a no-op
        assert!(store.sweep_job(&job_id, later, TIMEOUT).is_none());
        assert!(store.stale_jobs(later, TIMEOUT).is_empty());
    }

    #[test]
    fn test_straggler_reclassifies_and_upgrades() {
        let store = JobStore::new();
        let job_id = new_job(&store, &["a:eth", "b:eth"]);
        let created_at = store.get_meta(&job_id).unwrap().created_at;

        store
            .resolve_work_item(&job_id, &WorkKey::new("a", "eth"), WorkOutcome::Success, vec![])
            .unwrap();
        let swept = store
            .sweep_job(&job_id, created_at + TIMEOUT.as_millis() as u64 + 1, TIMEOUT)
            .unwrap();
        // The sweep finalizes as TimedOut even though one item already succeeded.
        assert_eq!(swept.meta.status(), JobStatus::TimedOut);
        assert_eq!(swept.swept, 1);
        assert_eq!((swept.meta.succeeded, swept.meta.timed_out), (1, 1));

        let resolution = store
            .resolve_work_item(&job_id, &WorkKey::new("b", "eth"), WorkOutcome::Success, vec![])
            .unwrap();

        assert_eq!(resolution, Resolution::Reclassified { upgraded: true });
        let meta = store.get_meta(&job_id).unwrap();
        assert_eq!(meta.status(), JobStatus::Completed);
        assert_eq!((meta.succeeded, meta.timed_out, meta.processed), (2, 0, 2));
        assert!(meta.counters_consistent());
    }

    #[test]
    fn test_failed_straggler_does_not_upgrade() {
        let store = JobStore::new();
        let job_id = new_job(&store, &["a:eth"]);
        let created_at = store.get_meta(&job_id).unwrap().created_at;
        store.sweep_job(&job_id, created_at + TIMEOUT.as_millis() as u64 + 1, TIMEOUT);

        let resolution = store
            .resolve_work_item(&job_id, &WorkKey::new("a", "eth"), WorkOutcome::Failed, vec![])
            .unwrap();

        assert_eq!(resolution, Resolution::Reclassified { upgraded: false });
        let meta = store.get_meta(&job_id).unwrap();
        assert_eq!(meta.status(), JobStatus::TimedOut);
        assert_eq!((meta.failed, meta.timed_out), (1, 0));
        assert!(meta.counters_consistent());
    }

    #[test]
    fn test_expansion_adds_only_unknown_items() {
        let store = JobStore::new();
        let job_id = new_job(&store, &["p1:eth"]);

        let added = store
            .expand(&job_id, keys(&["p1:eth", "p2:eth", "p2:eth"]), Duration::from_secs(30))
            .unwrap();

        assert_eq!(added, keys(&["p2:eth"]));
        let meta = store.get_meta(&job_id).unwrap();
        assert_eq!(meta.expected_total, 2);
        assert_eq!(store.pending_keys(&job_id).unwrap(), keys(&["p1:eth", "p2:eth"]));

        // Resolved items stay known
        store
            .resolve_work_item(&job_id, &WorkKey::new("p2", "eth"), WorkOutcome::Success, vec![])
            .unwrap();
        let added = store
            .expand(&job_id, keys(&["p2:eth"]), Duration::from_secs(30))
            .unwrap();
        assert!(added.is_empty());
    }

    #[test]
    fn test_expansion_dedups_mixed_case_follow_ups() {
        let store = JobStore::new();
        let job_id = new_job(&store, &["aave-v3:eth"]);

        let follow_ups: Vec<WorkKey> = serde_json::from_value(serde_json::json!([
            {"provider": "Aave-V3", "chain": "ETH"},
            {"provider": "Compound", "chain": "Eth"}
        ]))
        .unwrap();
        let added = store
            .expand(&job_id, follow_ups, Duration::from_secs(30))
            .unwrap();

        assert_eq!(added, keys(&["compound:eth"]));
        assert_eq!(store.get_meta(&job_id).unwrap().expected_total, 2);
        assert_eq!(
            store.pending_keys(&job_id).unwrap(),
            keys(&["aave-v3:eth", "compound:eth"])
        );
    }

    #[test]
    fn test_expansion_refused_when_finalized_or_expiring() {
        let store = JobStore::new();
        let finished = new_job(&store, &["p1:eth"]);
        store
            .resolve_work_item(&finished, &WorkKey::new("p1", "eth"), WorkOutcome::Success, vec![])
            .unwrap();

        assert_eq!(
            store.expand(&finished, keys(&["p2:eth"]), Duration::from_secs(30)),
            Err(StoreError::JobFinalized(finished))
        );

        let short_lived = store
            .create_or_reuse(&Account::new("0xdef"), &[ChainId::new("eth")], keys(&["p1:eth"]), Duration::from_secs(10))
            .job_id;
        assert!(matches!(
            store.expand(&short_lived, keys(&["p2:eth"]), Duration::from_secs(30)),
            Err(StoreError::ExpiringSoon(id, _)) if id == short_lived
        ));
        assert_eq!(store.get_meta(&short_lived).unwrap().expected_total, 1);
    }

    #[test]
    fn test_active_pointer_cleared_only_for_its_job() {
        let store = JobStore::new();
        let account = Account::new("0xabc");
        let chains = [ChainId::new("eth")];
        let job_id = new_job(&store, &["p:eth"]);
        let meta = store.get_meta(&job_id).unwrap();

        let mut stranger = meta.clone();
        stranger.job_id = JobId::new();
        assert!(!store.clear_active_pointer(&stranger));
        assert_eq!(store.active_job(&account, &chains), Some(job_id));

        assert!(store.clear_active_pointer(&meta));
        assert_eq!(store.active_job(&account, &chains), None);

        // The next start creates a fresh job
        let next = store.create_or_reuse(&account, &chains, keys(&["p:eth"]), TTL);
        assert!(next.created);
        assert_ne!(next.job_id, job_id);
    }

    #[test]
    fn test_recent_jobs_newest_first() {
        let store = JobStore::new();
        let account = Account::new("0xabc");

        let first = store
            .create_or_reuse(&account, &[ChainId::new("eth")], vec![], TTL)
            .job_id;
        std::thread::sleep(Duration::from_millis(5));
        let second = store
            .create_or_reuse(&account, &[ChainId::new("base")], vec![], TTL)
            .job_id;

        let recent = store.list_recent_jobs(&account, 10);
        let ids: Vec<JobId> = recent.iter().map(|meta| meta.job_id).collect();
        assert_eq!(ids, vec![second, first]);

        assert_eq!(store.list_recent_jobs(&account, 1).len(), 1);
        assert!(store.list_recent_jobs(&Account::new("0xnobody"), 10).is_empty());
    }

    // ============================================================
    // TEST 3: Concurrency
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_results_finalize_exactly_once() {
        // ARRANGE: 40 work items, every result delivered twice
        let store = Arc::new(JobStore::new());
        let items: Vec<String> = (0..40).map(|i| format!("p{}:eth", i)).collect();
        let item_refs: Vec<&str> = items.iter().map(String::as_str).collect();
        let job_id = new_job(&store, &item_refs);

        // ACT
        let mut handles = vec![];
        for worker in 0..8 {
            let store = store.clone();
            let items = items.clone();
            handles.push(tokio::spawn(async move {
                let mut finalized = 0;
                for item in items.iter().skip(worker % 4).step_by(4) {
                    let key: WorkKey = item.parse().unwrap();
                    let outcome = if item.ends_with("3:eth") {
                        WorkOutcome::Failed
                    } else {
                        WorkOutcome::Success
                    };
                    if !store.record_result(&job_id, &key, work_result(outcome), TTL) {
                        continue;
                    }
                    if let Resolution::Counted { finalized: Some(_) } =
                        store.resolve_work_item(&job_id, &key, outcome, vec![]).unwrap()
                    {
                        finalized += 1;
                    }
                }
                finalized
            }));
        }

        let mut finalizations = 0;
        for handle in handles {
            finalizations += handle.await.unwrap();
        }

        // ASSERT
        let meta = store.get_meta(&job_id).unwrap();
        assert_eq!(finalizations, 1);
        assert_eq!(meta.processed, 40);
        assert_eq!(meta.failed, 4);
        assert_eq!(meta.status(), JobStatus::CompletedWithErrors);
        assert!(meta.counters_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweeper_and_last_result_never_both_finalize() {
        for _ in 0..50 {
            let store = Arc::new(JobStore::new());
            let job_id = new_job(&store, &["p:eth"]);
            let stale_at = store.get_meta(&job_id).unwrap().created_at + TIMEOUT.as_millis() as u64 + 1;

            let sweeper_store = store.clone();
            let sweeper = tokio::spawn(async move {
                sweeper_store.sweep_job(&job_id, stale_at, TIMEOUT).is_some()
            });
            let result_store = store.clone();
            let aggregator = tokio::spawn(async move {
                matches!(
                    result_store
                        .resolve_work_item(&job_id, &WorkKey::new("p", "eth"), WorkOutcome::Success, vec![])
                        .unwrap(),
                    Resolution::Counted { finalized: Some(_) }
                )
            });

            let swept = sweeper.await.unwrap();
            let drained = aggregator.await.unwrap();

            assert!(swept ^ drained, "exactly one writer must finalize");
            let meta = store.get_meta(&job_id).unwrap();
            assert_eq!(meta.status(), JobStatus::Completed);
            assert!(meta.counters_consistent());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_coalesce() {
        let orchestrator = orchestrator_with(|registry| {
            registry.register("balances", &[], |_| async { Ok(balances_response()) });
        });

        let mut handles = vec![];
        for _ in 0..16 {
            let service = orchestrator.service.clone();
            handles.push(tokio::spawn(async move {
                service.start(start_request("0xABC", &["eth"])).unwrap()
            }));
        }

        let mut responses = vec![];
        for handle in handles {
            responses.push(handle.await.unwrap());
        }

        let job_id = responses[0].job_id;
        assert!(responses.iter().all(|r| r.job_id == job_id));
        assert_eq!(responses.iter().filter(|r| !r.reused).count(), 1);
        // Only the creating start dispatched
        assert_eq!(
            orchestrator
                .queue
                .messages_on(&TopicPattern::new(TOPIC_REQUEST_ALL))
                .len(),
            1
        );
    }

    // ============================================================
    // TEST 4: RequestWorker - retry policy
    // ============================================================

    #[tokio::test]
    async fn test_transient_failure_below_cap_is_retried() {
        // ARRANGE
        let orchestrator = orchestrator_with(|registry| {
            registry.register("flaky", &[], |_| async {
                Err(ProviderError::Transient("upstream 502".to_string()))
            });
        });
        let request = request_for(JobId::new(), "flaky", "eth", 1);

        // ACT
        let action = orchestrator.worker.handle(request.clone()).await.unwrap();

        // ASSERT: next attempt queued, no result emitted
        assert_eq!(
            action,
            WorkerAction::Retried {
                next_attempt: 2,
                delay: Duration::ZERO
            }
        );
        let requests = orchestrator
            .queue
            .messages_on(&TopicPattern::new(TOPIC_REQUEST_ALL));
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].topic, "integration.request.flaky");
        let retried: RequestMessage = requests[0].decode().unwrap();
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.request_id, request.request_id);
        assert!(orchestrator
            .queue
            .messages_on(&TopicPattern::new(TOPIC_RESULT_ALL))
            .is_empty());
    }

    #[tokio::test]
    async fn test_failures_at_cap_are_terminal() {
        let orchestrator = orchestrator_with(|registry| {
            registry.register("flaky", &[], |_| async {
                Err(ProviderError::Transient("upstream 502".to_string()))
            });
            registry.register("slow", &[], |_| async {
                Err(ProviderError::Timeout("gateway timeout".to_string()))
            });
        });

        let flaky = orchestrator
            .worker
            .handle(request_for(JobId::new(), "flaky", "eth", 3))
            .await
            .unwrap();
        let slow = orchestrator
            .worker
            .handle(request_for(JobId::new(), "slow", "eth", 3))
            .await
            .unwrap();

        assert_eq!(flaky, WorkerAction::Completed(WorkOutcome::Failed));
        assert_eq!(slow, WorkerAction::Completed(WorkOutcome::TimedOut));

        let results: Vec<ResultMessage> = orchestrator
            .queue
            .messages_on(&TopicPattern::new(TOPIC_RESULT_ALL))
            .iter()
            .map(|envelope| envelope.decode().unwrap())
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.error_code.as_deref() == Some("transient")));
        assert!(results.iter().any(|r| r.error_code.as_deref() == Some("timeout")));
        assert!(results.iter().all(|r| r.attempt == 3 && r.payload.is_none()));
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let orchestrator = orchestrator_with(|registry| {
            registry.register("locked", &[], |_| async {
                Err(ProviderError::Unauthorized("bad api key".to_string()))
            });
            registry.register("aborted", &[], |_| async {
                Err(ProviderError::Cancelled("client went away".to_string()))
            });
        });

        let locked = orchestrator
            .worker
            .handle(request_for(JobId::new(), "locked", "eth", 1))
            .await
            .unwrap();
        let aborted = orchestrator
            .worker
            .handle(request_for(JobId::new(), "aborted", "eth", 1))
            .await
            .unwrap();
        let unknown = orchestrator
            .worker
            .handle(request_for(JobId::new(), "ghost", "eth", 1))
            .await
            .unwrap();

        assert_eq!(locked, WorkerAction::Completed(WorkOutcome::Failed));
        assert_eq!(aborted, WorkerAction::Completed(WorkOutcome::Cancelled));
        assert_eq!(unknown, WorkerAction::Completed(WorkOutcome::Failed));
        assert!(orchestrator
            .queue
            .messages_on(&TopicPattern::new(TOPIC_REQUEST_ALL))
            .is_empty());
    }

    #[tokio::test]
    async fn test_slow_provider_hits_provider_timeout() {
        let orchestrator = orchestrator_with(|registry| {
            registry.register("sleepy", &[], |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(balances_response())
            });
        });

        let first = orchestrator
            .worker
            .handle(request_for(JobId::new(), "sleepy", "eth", 1))
            .await
            .unwrap();
        let last = orchestrator
            .worker
            .handle(request_for(JobId::new(), "sleepy", "eth", 3))
            .await
            .unwrap();

        assert!(matches!(first, WorkerAction::Retried { next_attempt: 2, .. }));
        assert_eq!(last, WorkerAction::Completed(WorkOutcome::TimedOut));
    }

    // ============================================================
    // TEST 5: Pipeline
    // ============================================================

    #[tokio::test]
    async fn test_job_completes_with_single_event() {
        // ARRANGE: one provider on three chains
        let orchestrator = orchestrator_with(|registry| {
            registry.register("balances", &[], |_| async { Ok(balances_response()) });
        });

        // ACT
        let started = orchestrator
            .service
            .start(start_request("0xABC", &["eth", "base", "arbitrum"]))
            .unwrap();
        orchestrator.run_until_idle().await;

        // ASSERT
        assert_eq!(started.expected_total, 3);
        let snapshot = orchestrator.service.status(&started.job_id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.meta.succeeded, 3);
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.output.items.len(), 3);
        assert_eq!(snapshot.output.sources.len(), 3);

        let events = completion_events(&orchestrator);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_id, started.job_id);
        assert_eq!(events[0].status, JobStatus::Completed);
        assert_eq!(events[0].total, 3);

        // Pointer released: the next start is a new job
        let again = orchestrator
            .service
            .start(start_request("0xabc", &["eth", "base", "arbitrum"]))
            .unwrap();
        assert!(!again.reused);
        assert_ne!(again.job_id, started.job_id);
    }

    #[tokio::test]
    async fn test_duplicate_result_delivery_counted_once() {
        let orchestrator = orchestrator_with(|registry| {
            registry.register("balances", &[], |_| async { Ok(balances_response()) });
        });
        let started = orchestrator
            .service
            .start(start_request("0xabc", &["eth", "base"]))
            .unwrap();
        orchestrator.request_consumer.drain().await;

        let results: Vec<ResultMessage> = orchestrator
            .queue
            .messages_on(&TopicPattern::new(TOPIC_RESULT_ALL))
            .iter()
            .map(|envelope| envelope.decode().unwrap())
            .collect();
        assert_eq!(results.len(), 2);

        let first = orchestrator.aggregator.handle(results[0].clone()).unwrap();
        let duplicate = orchestrator.aggregator.handle(results[0].clone()).unwrap();

        assert_eq!(first, ResultDisposition::Counted { finalized: false });
        assert_eq!(duplicate, ResultDisposition::Duplicate);
        let meta = orchestrator.store.get_meta(&started.job_id).unwrap();
        assert_eq!((meta.succeeded, meta.processed), (1, 1));

        // Partial output is visible while the job runs
        let snapshot = orchestrator.service.status(&started.job_id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.output.items.len(), 1);
    }

    #[tokio::test]
    async fn test_result_for_unknown_job_is_dropped() {
        let orchestrator = orchestrator_with(|_| {});
        let request = request_for(JobId::new(), "balances", "eth", 1);
        let result = ResultMessage::for_request(&request, WorkOutcome::Success, 1, 2);

        let disposition = orchestrator.aggregator.handle(result).unwrap();

        assert_eq!(disposition, ResultDisposition::JobGone);
        assert!(orchestrator.store.get_meta(&request.job_id).is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_recover_within_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let orchestrator = orchestrator_with(move |registry| {
            registry.register("flaky", &[], move |_| {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::Transient("connection reset".to_string()))
                    } else {
                        Ok(balances_response())
                    }
                }
            });
        });

        let started = orchestrator
            .service
            .start(start_request("0xabc", &["eth"]))
            .unwrap();
        orchestrator.run_until_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let meta = orchestrator.store.get_meta(&started.job_id).unwrap();
        assert_eq!(meta.status(), JobStatus::Completed);
        let result = orchestrator
            .store
            .get_result(&started.job_id, &WorkKey::new("flaky", "eth"))
            .unwrap();
        assert_eq!(result.attempt, 3);
    }

    #[tokio::test]
    async fn test_partial_failure_completes_with_errors() {
        let orchestrator = orchestrator_with(|registry| {
            registry.register("balances", &[], |_| async { Ok(balances_response()) });
            registry.register("walled", &[], |_| async {
                Err(ProviderError::Forbidden("geo-blocked".to_string()))
            });
        });

        let started = orchestrator
            .service
            .start(start_request("0xabc", &["eth"]))
            .unwrap();
        orchestrator.run_until_idle().await;

        let meta = orchestrator.store.get_meta(&started.job_id).unwrap();
        assert_eq!(meta.status(), JobStatus::CompletedWithErrors);
        assert_eq!((meta.succeeded, meta.failed), (1, 1));

        let failure = orchestrator
            .store
            .get_result(&started.job_id, &WorkKey::new("walled", "eth"))
            .unwrap();
        assert_eq!(failure.error_code.as_deref(), Some("forbidden"));
        assert_eq!(completion_events(&orchestrator).len(), 1);
    }

    #[tokio::test]
    async fn test_follow_ups_expand_the_job() {
        // ARRANGE: balances discovers an aave position on every chain it serves
        let orchestrator = orchestrator_with(|registry| {
            registry.register("balances", &[], |request| async move {
                let mut response = balances_response();
                response.follow_ups = vec![
                    WorkKey::new("aave", request.chain.as_str()),
                    WorkKey::new("balances", request.chain.as_str()),
                ];
                Ok(response)
            });
            registry.register("aave", &["eth"], |_| async {
                Ok(ProviderResponse::new(ProviderPayload::LendingPositions(vec![])))
            });
        });

        // ACT
        let started = orchestrator
            .service
            .start(StartAggregationRequest {
                providers: Some(vec!["balances".to_string()]),
                ..start_request("0xabc", &["eth"])
            })
            .unwrap();
        orchestrator.run_until_idle().await;

        // ASSERT
        assert_eq!(started.expected_total, 1);
        let meta = orchestrator.store.get_meta(&started.job_id).unwrap();
        assert_eq!(meta.expected_total, 2);
        assert_eq!(meta.succeeded, 2);
        assert_eq!(meta.status(), JobStatus::Completed);
        assert!(orchestrator
            .store
            .get_result(&started.job_id, &WorkKey::new("aave", "eth"))
            .is_some());
        assert_eq!(completion_events(&orchestrator).len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_times_out_then_stragglers_upgrade() {
        // ARRANGE: start a job but let no worker run
        let orchestrator = orchestrator_with(|registry| {
            registry.register("balances", &[], |_| async { Ok(balances_response()) });
        });
        let started = orchestrator
            .service
            .start(start_request("0xabc", &["eth", "base"]))
            .unwrap();

        // ACT: sweep past the timeout
        let timeout_ms = orchestrator.config.job_timeout.as_millis() as u64;
        assert_eq!(orchestrator.sweeper.sweep_at(now_ms() + timeout_ms + 1_000), 1);

        // ASSERT
        let meta = orchestrator.store.get_meta(&started.job_id).unwrap();
        assert_eq!(meta.status(), JobStatus::TimedOut);
        assert_eq!((meta.timed_out, meta.succeeded), (2, 0));
        assert!(orchestrator.store.get_result(&started.job_id, &WorkKey::new("balances", "eth")).is_none());
        assert_eq!(completion_events(&orchestrator).len(), 1);

        // ACT: the slow work items finally report in
        orchestrator.run_until_idle().await;

        // ASSERT: upgraded, still only one event
        let meta = orchestrator.store.get_meta(&started.job_id).unwrap();
        assert_eq!(meta.status(), JobStatus::Completed);
        assert_eq!((meta.succeeded, meta.timed_out, meta.processed), (2, 0, 2));
        assert!(meta.counters_consistent());
        assert_eq!(completion_events(&orchestrator).len(), 1);
        assert_eq!(completion_events(&orchestrator)[0].status, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_job_without_work_items_finishes_immediately() {
        let orchestrator = orchestrator_with(|registry| {
            registry.register("aave", &["eth"], |_| async {
                Ok(ProviderResponse::new(ProviderPayload::LendingPositions(vec![])))
            });
        });

        let started = orchestrator
            .service
            .start(start_request("0xabc", &["solana"]))
            .unwrap();

        assert_eq!(started.expected_total, 0);
        let meta = orchestrator.store.get_meta(&started.job_id).unwrap();
        assert_eq!(meta.status(), JobStatus::Completed);
        assert_eq!(completion_events(&orchestrator).len(), 1);
        assert_eq!(
            orchestrator
                .store
                .active_job(&Account::new("0xabc"), &[ChainId::new("solana")]),
            None
        );
    }

    #[tokio::test]
    async fn test_start_rejects_empty_input() {
        let orchestrator = orchestrator_with(|_| {});

        assert!(orchestrator.service.start(start_request("  ", &["eth"])).is_err());
        assert!(orchestrator.service.start(start_request("0xabc", &[])).is_err());
        assert!(orchestrator.service.start(start_request("0xabc", &[" "])).is_err());
        assert_eq!(orchestrator.store.job_count(), 0);
    }
}
