//! End-to-end engine scenarios over in-memory stores, with real `sh`-backed
//! sandboxes where subprocess behavior matters and canned runners where
//! timing must be deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use fnhive_engine::{Engine, EngineConfig, ExecutionRequest};
use fnhive_sandbox::{InterpreterConfig, SandboxError, SandboxOutcome, SandboxRunner};
use fnhive_store::{
    ExecutionLog, ExecutionStatus, InMemoryExecutionLog, InMemoryQuotaStore, QuotaStore,
    StoreError, UserQuota,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Hand the scratch unit to `sh` as `$0` so tests run without a JS runtime.
fn sh_config(script: &str, wall_ms: u64) -> EngineConfig {
    EngineConfig {
        max_wall_ms: wall_ms,
        interpreter: InterpreterConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        },
        scratch_dir: std::env::temp_dir()
            .join(format!("fnhive-engine-test-{}", std::process::id())),
        ..EngineConfig::default()
    }
}

fn stores() -> (Arc<InMemoryQuotaStore>, Arc<InMemoryExecutionLog>) {
    let quotas = Arc::new(InMemoryQuotaStore::new());
    quotas.init("u1").unwrap();
    (quotas, Arc::new(InMemoryExecutionLog::new()))
}

fn request(function_id: &str) -> ExecutionRequest {
    ExecutionRequest {
        function_id: function_id.to_string(),
        owner_id: "u1".to_string(),
        source_code: "return new Response('unused by sh')".to_string(),
        input: Some(json!({"name": "ada"})),
    }
}

/// Completes successfully after a fixed delay; used where admission timing
/// matters and subprocess startup jitter would flake.
struct SlowRunner {
    delay: Duration,
}

#[async_trait]
impl SandboxRunner for SlowRunner {
    async fn run(
        &self,
        _source_code: &str,
        _input: Option<Value>,
        _deadline_ms: u64,
    ) -> Result<SandboxOutcome, SandboxError> {
        tokio::time::sleep(self.delay).await;
        Ok(SandboxOutcome::Completed {
            success: true,
            exit_code: Some(0),
            stdout: "done\n".to_string(),
            stderr: String::new(),
        })
    }
}

/// In-memory quota store whose `get` blocks like a slow durable read and
/// records how many reads are in flight at once.
struct SlowReadQuotaStore {
    inner: InMemoryQuotaStore,
    read_delay: Duration,
    reads_in_flight: AtomicUsize,
    max_reads_in_flight: AtomicUsize,
}

impl SlowReadQuotaStore {
    fn new(read_delay: Duration) -> Self {
        Self {
            inner: InMemoryQuotaStore::new(),
            read_delay,
            reads_in_flight: AtomicUsize::new(0),
            max_reads_in_flight: AtomicUsize::new(0),
        }
    }

    fn max_overlap(&self) -> usize {
        self.max_reads_in_flight.load(Ordering::SeqCst)
    }
}

impl QuotaStore for SlowReadQuotaStore {
    fn get(&self, owner_id: &str) -> Result<Option<UserQuota>, StoreError> {
        let in_flight = self.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_reads_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        std::thread::sleep(self.read_delay);
        self.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.get(owner_id)
    }

    fn init(&self, owner_id: &str) -> Result<(), StoreError> {
        self.inner.init(owner_id)
    }

    fn add_cpu_ms(&self, owner_id: &str, delta_ms: i64) -> Result<(), StoreError> {
        self.inner.add_cpu_ms(owner_id, delta_ms)
    }

    fn inc_concurrent(&self, owner_id: &str) -> Result<(), StoreError> {
        self.inner.inc_concurrent(owner_id)
    }

    fn try_inc_concurrent(&self, owner_id: &str, ceiling: i64) -> Result<bool, StoreError> {
        self.inner.try_inc_concurrent(owner_id, ceiling)
    }

    fn dec_concurrent(&self, owner_id: &str) -> Result<(), StoreError> {
        self.inner.dec_concurrent(owner_id)
    }

    fn reset_cpu_if_older_than(&self, interval: chrono::Duration) -> Result<u64, StoreError> {
        self.inner.reset_cpu_if_older_than(interval)
    }

    fn clear_all_concurrent(&self) -> Result<u64, StoreError> {
        self.inner.clear_all_concurrent()
    }
}

struct PanickingRunner;

#[async_trait]
impl SandboxRunner for PanickingRunner {
    async fn run(
        &self,
        _source_code: &str,
        _input: Option<Value>,
        _deadline_ms: u64,
    ) -> Result<SandboxOutcome, SandboxError> {
        panic!("runner blew up");
    }
}

#[tokio::test]
async fn happy_path_returns_envelope_output() {
    init_tracing();
    let script = r#"echo '{"status":200,"headers":{"Content-Type":"application/json"},"body":"{\"hello\":\"ada\"}"}'"#;
    let (quotas, log) = stores();
    let engine = Engine::new(sh_config(script, 15_000), quotas.clone(), log.clone());

    let result = engine.execute(request("f-happy")).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(result.error.is_none());
    assert!(result.elapsed_ms < 15_000);
    let output: Value =
        serde_json::from_str(result.output.as_deref().expect("output")).expect("envelope json");
    assert_eq!(output["status"], 200);
    assert_eq!(output["headers"]["Content-Type"], "application/json");
    assert_eq!(output["body"]["hello"], "ada");

    let rows = log.list_recent(10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].function_id, "f-happy");
    assert_eq!(engine.current_instance_count(), 0);
    assert_eq!(quotas.get("u1").unwrap().expect("row").concurrent_count, 0);
}

#[tokio::test]
async fn runaway_function_is_killed_at_the_deadline() {
    let (quotas, log) = stores();
    let engine = Engine::new(sh_config("sleep 30", 500), quotas.clone(), log.clone());

    let result = engine.execute(request("f-loop")).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    let error = result.error.as_deref().expect("error");
    assert!(error.starts_with("Execution timeout"), "got: {error}");
    assert!(result.elapsed_ms >= 500);
    assert!(result.elapsed_ms < 5_000, "kill was not timely: {}", result.elapsed_ms);

    // Timed-out invocations are billed and logged like any other.
    assert_eq!(log.list_recent(10).unwrap().len(), 1);
    assert!(quotas.get("u1").unwrap().expect("row").cpu_time_used_ms >= 500);
    assert_eq!(engine.current_instance_count(), 0);
}

#[tokio::test]
async fn throwing_function_returns_stderr_and_is_logged() {
    let (quotas, log) = stores();
    let engine = Engine::new(
        sh_config("echo 'Error: boom' >&2; exit 1", 15_000),
        quotas.clone(),
        log.clone(),
    );

    let result = engine.execute(request("f-throw")).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.error.as_deref().expect("error").contains("boom"));
    assert!(result.output.is_none());
    assert!(result.elapsed_ms < 15_000);

    let rows = log.list_recent(10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ExecutionStatus::Error);
}

#[tokio::test]
async fn machine_at_capacity_rejects_without_logging() {
    let (quotas, log) = stores();
    let config = EngineConfig {
        max_machine_instances: 1,
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::with_runner(
        config,
        quotas.clone(),
        log.clone(),
        Arc::new(SlowRunner {
            delay: Duration::from_millis(400),
        }),
    ));

    let holder = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute(request("f-holder")).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.current_instance_count(), 1);

    let rejected = engine.execute(request("f-rejected")).await;
    assert_eq!(rejected.status, ExecutionStatus::Error);
    assert_eq!(
        rejected.error.as_deref(),
        Some("Machine at capacity: maximum 1 concurrent instances reached")
    );
    assert_eq!(rejected.elapsed_ms, 0);

    let held = holder.await.expect("holder task");
    assert_eq!(held.status, ExecutionStatus::Success);

    // Only the admitted invocation reached the log.
    assert_eq!(log.list_recent(10).unwrap().len(), 1);
    assert_eq!(engine.current_instance_count(), 0);
}

#[tokio::test]
async fn user_concurrency_ceiling_rejects_new_work() {
    let (quotas, log) = stores();
    let config = EngineConfig {
        max_user_concurrent: 2,
        recover_concurrency_on_start: false,
        ..EngineConfig::default()
    };
    // Two in-flight executions for this user, tracked by the quota row.
    quotas.inc_concurrent("u1").unwrap();
    quotas.inc_concurrent("u1").unwrap();
    let engine = Engine::with_runner(
        config,
        quotas.clone(),
        log.clone(),
        Arc::new(SlowRunner {
            delay: Duration::from_millis(1),
        }),
    );

    let result = engine.execute(request("f-user-cap")).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result
        .error
        .as_deref()
        .expect("error")
        .contains("User concurrency limit reached: maximum 2"));
    assert_eq!(result.elapsed_ms, 0);
    assert!(log.list_recent(10).unwrap().is_empty());
    assert_eq!(quotas.get("u1").unwrap().expect("row").concurrent_count, 2);
}

#[tokio::test]
async fn cpu_overrun_mid_flight_errors_but_still_bills() {
    let (quotas, log) = stores();
    quotas.add_cpu_ms("u1", 400).unwrap();
    let config = EngineConfig {
        max_user_cpu_ms: 500,
        ..EngineConfig::default()
    };
    let engine = Engine::with_runner(
        config,
        quotas.clone(),
        log.clone(),
        Arc::new(SlowRunner {
            delay: Duration::from_millis(200),
        }),
    );

    let result = engine.execute(request("f-budget")).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(
        result.error.as_deref(),
        Some("execution would exceed CPU time quota")
    );

    // Settled over the cap: the overrun is billed, not forgiven.
    let quota = quotas.get("u1").unwrap().expect("row");
    assert!(quota.cpu_time_used_ms > 500, "billed: {}", quota.cpu_time_used_ms);
    assert_eq!(log.list_recent(10).unwrap().len(), 1);
    assert_eq!(engine.current_instance_count(), 0);
}

#[tokio::test]
async fn concurrent_count_is_decremented_exactly_once_per_invocation() {
    let (quotas, log) = stores();
    // Three in-flight executions owned by other orchestrators.
    for _ in 0..3 {
        quotas.inc_concurrent("u1").unwrap();
    }
    let config = EngineConfig {
        recover_concurrency_on_start: false,
        ..EngineConfig::default()
    };
    let engine = Engine::with_runner(
        config,
        quotas.clone(),
        log,
        Arc::new(SlowRunner {
            delay: Duration::from_millis(1),
        }),
    );

    let result = engine.execute(request("f-single-dec")).await;
    assert_eq!(result.status, ExecutionStatus::Success);

    // 3 -> 4 at admission, back to 3 at ticket release; the orchestrator's
    // settlement writes CPU time only.
    assert_eq!(quotas.get("u1").unwrap().expect("row").concurrent_count, 3);
}

#[tokio::test]
async fn panicking_runner_still_releases_both_slots() {
    let (quotas, log) = stores();
    let engine = Arc::new(Engine::with_runner(
        EngineConfig::default(),
        quotas.clone(),
        log.clone(),
        Arc::new(PanickingRunner),
    ));

    let handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute(request("f-panic")).await }
    });
    let joined = handle.await;
    assert!(joined.expect_err("panic propagates").is_panic());

    assert_eq!(engine.current_instance_count(), 0);
    assert_eq!(quotas.get("u1").unwrap().expect("row").concurrent_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_storm_holds_the_ceiling_and_settles_clean() {
    init_tracing();
    let (quotas, log) = stores();
    let config = EngineConfig {
        max_machine_instances: 3,
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::with_runner(
        config,
        quotas.clone(),
        log.clone(),
        Arc::new(SlowRunner {
            delay: Duration::from_millis(150),
        }),
    ));

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.execute(request(&format!("f-storm-{i}"))).await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        let result = handle.await.expect("storm task");
        match result.status {
            ExecutionStatus::Success => admitted += 1,
            ExecutionStatus::Error => {
                assert!(result
                    .error
                    .as_deref()
                    .expect("error")
                    .starts_with("Machine at capacity"));
                rejected += 1;
            }
        }
    }

    assert_eq!(admitted + rejected, 8);
    assert!(admitted >= 3, "admitted only {admitted}");
    assert_eq!(log.list_recent(20).unwrap().len(), admitted);
    assert_eq!(engine.current_instance_count(), 0);
    assert_eq!(quotas.get("u1").unwrap().expect("row").concurrent_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn distinct_owners_admit_concurrently_without_cross_tenant_blocking() {
    init_tracing();
    let owners = ["tenant-a", "tenant-b", "tenant-c", "tenant-d"];
    let read_delay = Duration::from_millis(300);
    let quotas = Arc::new(SlowReadQuotaStore::new(read_delay));
    for owner in owners {
        quotas.init(owner).unwrap();
    }
    let log = Arc::new(InMemoryExecutionLog::new());
    let config = EngineConfig {
        max_machine_instances: owners.len(),
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::with_runner(
        config,
        quotas.clone(),
        log.clone(),
        Arc::new(SlowRunner {
            delay: Duration::from_millis(50),
        }),
    ));

    let started = Instant::now();
    let mut handles = Vec::new();
    for owner in owners {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .execute(ExecutionRequest {
                    function_id: format!("f-{owner}"),
                    owner_id: owner.to_string(),
                    source_code: "return 1".to_string(),
                    input: None,
                })
                .await
        }));
    }
    for handle in handles {
        let result = handle.await.expect("tenant task");
        assert_eq!(result.status, ExecutionStatus::Success);
    }
    let elapsed = started.elapsed();

    // Nobody was near a ceiling, so no invocation may block another: the
    // slow quota reads of unrelated tenants must overlap. Admissions
    // serialized behind one another would spend 4 x 300ms on admission
    // reads alone, before any post-run reads.
    assert!(
        elapsed < Duration::from_millis(1_200),
        "tenants serialized behind each other's quota checks: {elapsed:?}"
    );
    assert!(
        quotas.max_overlap() >= 2,
        "quota reads never ran concurrently"
    );

    assert_eq!(log.list_recent(10).unwrap().len(), owners.len());
    assert_eq!(engine.current_instance_count(), 0);
    for owner in owners {
        assert_eq!(
            quotas.inner.get(owner).unwrap().expect("row").concurrent_count,
            0
        );
    }
}

#[tokio::test]
async fn rejected_owner_without_quota_row_is_a_setup_error() {
    let quotas: Arc<InMemoryQuotaStore> = Arc::new(InMemoryQuotaStore::new());
    let log = Arc::new(InMemoryExecutionLog::new());
    let engine = Engine::with_runner(
        EngineConfig::default(),
        quotas.clone(),
        log.clone(),
        Arc::new(SlowRunner {
            delay: Duration::from_millis(1),
        }),
    );

    let result = engine.execute(request("f-no-quota")).await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(
        result.error.as_deref(),
        Some("quota not initialized for owner u1")
    );
    assert_eq!(result.elapsed_ms, 0);
    assert!(log.list_recent(10).unwrap().is_empty());
    assert!(quotas.get("u1").unwrap().is_none());
}
