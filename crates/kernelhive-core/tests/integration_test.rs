//! End-to-end tests for the kernel manager.
//!
//! These drive real script engines in both execution modes through the
//! public manager API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;

use kernelhive_config::{Config, PoolConfig};
use kernelhive_core::{
    EngineRegistry, HostCapabilities, InterruptController, KernelManager, KernelProvisioner,
    KernelSpawner, ListenerId, PoolKeyConfig, PoolStats, PreparedKernel,
};
use kernelhive_engine_script::ScriptEngineFactory;
use kernelhive_protocols::{
    CreateKernelOptions, EngineError, EngineFactory, EngineInit, EventKind, ExecutionEngine,
    InterruptionMode, KernelError, KernelMode, KernelSpec, KernelState, ParentContext,
    StreamEvent,
};

// ============================================================================
// Test Helpers
// ============================================================================

const MODES: [KernelMode; 2] = [KernelMode::InProcess, KernelMode::IsolatedWorker];

/// Factory whose engines never come up.
struct BrokenFactory;

impl EngineFactory for BrokenFactory {
    fn language(&self) -> &str {
        "broken"
    }

    fn create(&self, _init: &EngineInit) -> Result<Box<dyn ExecutionEngine>, EngineError> {
        Err(EngineError::CreationFailed("engine refused to start".to_string()))
    }
}

fn engines() -> EngineRegistry {
    EngineRegistry::new()
        .with(Arc::new(ScriptEngineFactory::new()))
        .unwrap()
        .with(Arc::new(BrokenFactory))
        .unwrap()
}

fn manager() -> KernelManager {
    manager_with(Config::default())
}

fn manager_with(config: Config) -> KernelManager {
    KernelManager::new(config, engines())
}

async fn create(manager: &KernelManager, mode: KernelMode) -> String {
    manager
        .create_kernel(CreateKernelOptions::new().with_mode(mode))
        .await
        .unwrap()
}

async fn wait_for_state(manager: &KernelManager, id: &str, state: KernelState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if manager.get_kernel(id).map(|k| k.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("kernel {} never reached {:?}", id, state);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_create_defaults() {
    let manager = manager();
    let id = manager.create_kernel(CreateKernelOptions::new()).await.unwrap();

    let info = manager.get_kernel(&id).unwrap();
    assert_eq!(info.mode, KernelMode::IsolatedWorker);
    assert_eq!(info.language, "script");
    assert_eq!(info.namespace, "global");
    assert_eq!(info.state, KernelState::Idle);
    assert!(!info.from_pool);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explicit_id_conflict() {
    let manager = manager();
    let options = CreateKernelOptions::new()
        .with_id("fixed")
        .with_mode(KernelMode::InProcess);
    assert_eq!(manager.create_kernel(options.clone()).await.unwrap(), "fixed");
    assert!(matches!(
        manager.create_kernel(options).await,
        Err(KernelError::IdConflict(id)) if id == "fixed"
    ));
    assert_eq!(manager.list_kernels(None).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsupported_kernel_types() {
    let manager = manager();
    let err = manager
        .create_kernel(CreateKernelOptions::new().with_language("cobol"))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::UnsupportedKernelType { .. }));

    let mut config = Config::default();
    config.manager.allowed_kernel_types = vec![KernelSpec::new(KernelMode::InProcess, "script")];
    let restricted = manager_with(config);
    let err = restricted
        .create_kernel(CreateKernelOptions::new().with_mode(KernelMode::IsolatedWorker))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::UnsupportedKernelType { .. }));
    assert!(restricted.list_kernels(None).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_spawn_failure_leaves_no_entry() {
    let manager = manager();
    let err = manager
        .create_kernel(
            CreateKernelOptions::new()
                .with_mode(KernelMode::IsolatedWorker)
                .with_language("broken"),
        )
        .await
        .unwrap_err();
    match err {
        KernelError::WorkerSpawnFailure(reason) => assert!(reason.contains("refused")),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(manager.list_kernels(None).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_destroy_twice() {
    for mode in MODES {
        let manager = manager();
        let id = create(&manager, mode).await;

        assert!(manager.destroy_kernel(&id).await);
        assert!(!manager.destroy_kernel(&id).await);
        assert!(manager.get_kernel(&id).is_none());
        assert!(manager.list_kernels(None).is_empty());
        assert!(matches!(
            manager.execute(&id, "1").await,
            Err(KernelError::KernelNotFound(_))
        ));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_namespaces_and_destroy_all() {
    let manager = manager();
    for ns in ["alpha", "alpha", "beta"] {
        manager
            .create_kernel(
                CreateKernelOptions::new()
                    .with_mode(KernelMode::InProcess)
                    .with_namespace(ns),
            )
            .await
            .unwrap();
    }

    assert_eq!(manager.list_kernels(Some("alpha")).len(), 2);
    assert_eq!(manager.list_kernels(Some("beta")).len(), 1);
    assert_eq!(manager.list_kernels(None).len(), 3);

    assert_eq!(manager.destroy_all(Some("alpha")).await, 2);
    let remaining = manager.list_kernels(None);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].namespace, "beta");

    assert_eq!(manager.destroy_all(None).await, 1);
    assert!(manager.list_kernels(None).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_closes_manager() {
    let manager = manager();
    create(&manager, KernelMode::InProcess).await;
    create(&manager, KernelMode::IsolatedWorker).await;

    manager.shutdown().await;
    assert!(manager.is_closed());
    assert!(manager.list_kernels(None).is_empty());
    assert!(matches!(
        manager.create_kernel(CreateKernelOptions::new()).await,
        Err(KernelError::ManagerClosed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_destroy_busy_kernel_stops_execution() {
    for mode in MODES {
        let manager = manager();
        let id = create(&manager, mode).await;

        let running = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.execute(&id, "sleep 20000").await })
        };
        wait_for_state(&manager, &id, KernelState::Busy).await;

        let started = Instant::now();
        assert!(manager.destroy_kernel(&id).await);
        let result = running.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(manager.get_kernel(&id).is_none());
    }
}

// ============================================================================
// Execution
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_kernels_are_isolated() {
    for mode in MODES {
        let manager = manager();
        let a = create(&manager, mode).await;
        let b = create(&manager, mode).await;

        assert!(manager.execute(&a, "let x = 1").await.unwrap().success);
        assert!(manager.execute(&b, "let x = 2").await.unwrap().success);

        let ra = manager.execute(&a, "x").await.unwrap();
        let rb = manager.execute(&b, "x").await.unwrap();
        assert_eq!(ra.result.unwrap().plain_text(), Some("1"));
        assert_eq!(rb.result.unwrap().plain_text(), Some("2"));
        manager.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_preserves_order() {
    for mode in MODES {
        let manager = manager();
        let id = create(&manager, mode).await;

        let stream = manager
            .execute_stream(&id, "print \"one\"\nprint \"two\"\nprint \"three\"", None)
            .await
            .unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::stdout("one\n"),
                StreamEvent::stdout("two\n"),
                StreamEvent::stdout("three\n"),
            ]
        );
        manager.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_carries_request_id() {
    let manager = manager();
    let id = create(&manager, KernelMode::InProcess).await;
    let stream = manager
        .execute_stream(&id, "1 + 1", Some(ParentContext::new("req-7")))
        .await
        .unwrap();
    assert_eq!(stream.kernel_id(), id);
    assert_eq!(stream.request_id(), "req-7");

    let events: Vec<StreamEvent> = stream.collect().await;
    match events.as_slice() {
        [StreamEvent::ExecuteResult(r)] => {
            assert_eq!(r.execution_count, 1);
            assert_eq!(r.data.plain_text(), Some("2"));
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_collects_streams_and_error() {
    for mode in MODES {
        let manager = manager();
        let id = create(&manager, mode).await;

        let result = manager
            .execute(&id, "print \"out\"\neprint \"err\"\nraise ValueError \"bad\"")
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        let error = result.error.unwrap();
        assert_eq!(error.ename, "ValueError");
        assert_eq!(error.evalue, "bad");

        let next = manager.execute(&id, "let y = 3\ny + 1").await.unwrap();
        assert!(next.success);
        assert_eq!(next.result.unwrap().plain_text(), Some("4"));
        manager.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_engine_panic_is_contained() {
    let cases = [
        (KernelMode::InProcess, "EnginePanic"),
        (KernelMode::IsolatedWorker, "WorkerPanic"),
    ];
    for (mode, ename) in cases {
        let manager = manager();
        let id = create(&manager, mode).await;

        let result = manager.execute(&id, "panic \"boom\"").await.unwrap();
        assert_eq!(result.error.unwrap().ename, ename);
        assert_eq!(manager.get_kernel(&id).unwrap().state, KernelState::Idle);
        assert!(manager.execute(&id, "7").await.unwrap().success);
        manager.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_executions_are_serialized() {
    let manager = manager();
    let id = create(&manager, KernelMode::IsolatedWorker).await;
    manager.execute(&id, "let n = 0").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            manager.execute(&id, "sleep 5\nlet n = n + 1\nn").await.unwrap()
        }));
    }
    let mut counts = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        counts.push(result.result.unwrap().plain_text().unwrap().to_string());
    }
    counts.sort();
    assert_eq!(counts, vec!["1", "2", "3", "4", "5"]);
}

// ============================================================================
// Interrupts and Limits
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupt_idle_kernel_is_noop() {
    let manager = manager();
    let id = create(&manager, KernelMode::IsolatedWorker).await;
    assert!(manager.interrupt_kernel(&id).await.unwrap());
    assert!(manager.execute(&id, "1").await.unwrap().success);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupt_busy_kernel() {
    for mode in MODES {
        let manager = manager();
        let id = create(&manager, mode).await;

        let running = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.execute(&id, "print \"start\"\nsleep 20000").await })
        };
        wait_for_state(&manager, &id, KernelState::Busy).await;

        let started = Instant::now();
        assert!(manager.interrupt_kernel(&id).await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(manager.get_kernel(&id).unwrap().state, KernelState::Idle);

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.stdout, "start\n");
        assert_eq!(result.error.unwrap().ename, "KeyboardInterrupt");

        let after = manager.execute(&id, "2 + 2").await.unwrap();
        assert_eq!(after.result.unwrap().plain_text(), Some("4"));
        manager.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupt_cuts_output_short() {
    let manager = manager();
    let id = create(&manager, KernelMode::IsolatedWorker).await;

    let running = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move {
            manager
                .execute(&id, "repeat 1000 as i\nprint i\nsleep 10\nend")
                .await
        })
    };
    wait_for_state(&manager, &id, KernelState::Busy).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.interrupt_kernel(&id).await.unwrap());

    let result = running.await.unwrap().unwrap();
    let lines = result.stdout.lines().count();
    assert!(lines > 0 && lines < 1000, "printed {} lines", lines);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupt_unavailable_without_shared_memory() {
    let mut config = Config::default();
    config.host.shared_memory = false;
    let manager = manager_with(config);
    let id = create(&manager, KernelMode::IsolatedWorker).await;

    let running = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.execute(&id, "sleep 300").await })
    };
    wait_for_state(&manager, &id, KernelState::Busy).await;
    assert!(!manager.interrupt_kernel(&id).await.unwrap());
    assert!(running.await.unwrap().unwrap().success);
}

#[test]
fn test_direct_interrupt_before_execution_starts() {
    // One blocking thread, held busy so the execution queues behind it.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .max_blocking_threads(1)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let mut config = Config::default();
        config.manager.interruption_mode = InterruptionMode::DirectCall;
        let manager = manager_with(config);
        let id = create(&manager, KernelMode::InProcess).await;

        let blocker =
            tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(300)));
        let running = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move {
                manager
                    .execute(&id, "sleep 1500\nprint \"completed\"")
                    .await
            })
        };
        wait_for_state(&manager, &id, KernelState::Busy).await;
        assert!(manager.interrupt_kernel(&id).await.unwrap());

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.error.unwrap().ename, "KeyboardInterrupt");
        assert!(!result.stdout.contains("completed"));
        blocker.await.unwrap();

        let after = manager.execute(&id, "print \"again\"").await.unwrap();
        assert_eq!(after.stdout, "again\n");
        manager.shutdown().await;
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn test_max_execution_time() {
    for mode in MODES {
        let manager = manager();
        let id = manager
            .create_kernel(
                CreateKernelOptions::new()
                    .with_mode(mode)
                    .with_max_execution_time(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        let started = Instant::now();
        let result = manager.execute(&id, "sleep 20000").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.error.unwrap().ename, "KeyboardInterrupt");
        assert!(manager.execute(&id, "1").await.unwrap().success);
        manager.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inactivity_timeout_reaps_kernel() {
    let manager = manager();
    let id = manager
        .create_kernel(
            CreateKernelOptions::new()
                .with_mode(KernelMode::InProcess)
                .with_inactivity_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    assert!(manager.get_kernel(&id).is_some());

    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.get_kernel(&id).is_some() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(manager.get_kernel(&id).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_kernel_is_not_reaped() {
    let manager = manager();
    let id = manager
        .create_kernel(
            CreateKernelOptions::new()
                .with_mode(KernelMode::InProcess)
                .with_inactivity_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    let result = manager.execute(&id, "sleep 300\n5").await.unwrap();
    assert_eq!(result.result.unwrap().plain_text(), Some("5"));
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_listeners_observe_stream_events() {
    let manager = manager();
    let id = create(&manager, KernelMode::InProcess).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let listener = manager
        .on_kernel_event(&id, EventKind::Stream, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    manager.execute(&id, "print 1\nprint 2\n3").await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    assert!(manager.off_kernel_event(&id, listener));
    assert!(!manager.off_kernel_event(&id, listener));
    manager.execute(&id, "print 4").await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_can_unsubscribe_itself() {
    let manager = manager();
    let id = create(&manager, KernelMode::InProcess).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let own_id: Arc<OnceLock<ListenerId>> = Arc::new(OnceLock::new());
    let listener = {
        let handle = manager.clone();
        let kernel_id = id.clone();
        let own_id = own_id.clone();
        let seen = seen.clone();
        manager
            .on_kernel_event(&id, EventKind::Stream, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                if let Some(listener) = own_id.get() {
                    handle.off_kernel_event(&kernel_id, *listener);
                }
            })
            .unwrap()
    };
    own_id.set(listener).unwrap();

    manager.execute(&id, "print 1\nprint 2\nprint 3").await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_kernel_info_is_published() {
    for mode in MODES {
        let manager = manager();
        let id = create(&manager, mode).await;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        manager
            .on_kernel_event(&id, EventKind::KernelInfo, move |event| {
                assert!(matches!(event, StreamEvent::KernelInfo(_)));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let reply = manager.kernel_info(&id).unwrap();
        assert_eq!(reply.language, "script");
        assert_eq!(reply.mode, mode);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_listener_does_not_wedge_kernel() {
    for mode in MODES {
        let manager = manager();
        let id = create(&manager, mode).await;
        manager
            .on_kernel_event(&id, EventKind::Stream, |_| panic!("listener bug"))
            .unwrap();

        let result = manager.execute(&id, "print 1\nprint 2").await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "1\n2\n");
        assert_eq!(manager.get_kernel(&id).unwrap().state, KernelState::Idle);

        let again = manager.execute(&id, "3 + 4").await.unwrap();
        assert_eq!(again.result.unwrap().plain_text(), Some("7"));
        manager.shutdown().await;
    }
}

// ============================================================================
// Pool
// ============================================================================

fn pooled_config(size: usize) -> Config {
    let mut config = Config::default();
    config.pool = PoolConfig {
        enabled: true,
        pool_size: size,
        auto_refill: true,
        preload: vec![KernelSpec::new(KernelMode::InProcess, "script")],
        ..Default::default()
    };
    config
}

async fn wait_for_pool(manager: &KernelManager, key: &str, available: usize) -> PoolStats {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = manager.get_pool_stats().get(key).copied().unwrap_or_default();
        assert!(stats.available <= stats.total, "available exceeded total: {:?}", stats);
        if stats.available == available || Instant::now() >= deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pool_hit_and_refill() {
    let manager = manager_with(pooled_config(2));
    manager.initialize_pool();
    assert_eq!(
        wait_for_pool(&manager, "in-process:script", 2).await,
        PoolStats { available: 2, total: 2 }
    );

    let id = create(&manager, KernelMode::InProcess).await;
    assert!(manager.get_kernel(&id).unwrap().from_pool);
    assert!(manager.execute(&id, "print 1").await.unwrap().success);

    assert_eq!(wait_for_pool(&manager, "in-process:script", 2).await.available, 2);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_custom_init_bypasses_pool() {
    let manager = manager_with(pooled_config(1));
    manager.initialize_pool();
    wait_for_pool(&manager, "in-process:script", 1).await;

    let id = manager
        .create_kernel(
            CreateKernelOptions::new()
                .with_mode(KernelMode::InProcess)
                .with_env("GREETING", "hi"),
        )
        .await
        .unwrap();
    assert!(!manager.get_kernel(&id).unwrap().from_pool);
    assert_eq!(
        manager.get_pool_stats()["in-process:script"],
        PoolStats { available: 1, total: 1 }
    );

    let result = manager.execute(&id, "print env.GREETING").await.unwrap();
    assert_eq!(result.stdout, "hi\n");
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_configure_pool_at_runtime() {
    let manager = manager();
    let spec = KernelSpec::new(KernelMode::IsolatedWorker, "script");
    assert!(manager.get_pool_key_config(&spec).is_none());

    let key_config = PoolKeyConfig {
        pool_size: 1,
        auto_refill: false,
        enabled: true,
    };
    manager.configure_pool(&spec, key_config).unwrap();
    assert_eq!(manager.get_pool_key_config(&spec), Some(key_config));
    wait_for_pool(&manager, "isolated-worker:script", 1).await;

    let id = create(&manager, KernelMode::IsolatedWorker).await;
    assert!(manager.get_kernel(&id).unwrap().from_pool);

    let unknown = KernelSpec::new(KernelMode::InProcess, "cobol");
    assert!(matches!(
        manager.configure_pool(&unknown, key_config),
        Err(KernelError::UnsupportedKernelType { .. })
    ));
    manager.shutdown().await;
    assert!(manager.get_pool_stats()["isolated-worker:script"].available == 0);
}

/// Provisioner that fails its first few calls, then spawns for real.
struct FlakyProvisioner {
    spawner: KernelSpawner,
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl KernelProvisioner for FlakyProvisioner {
    async fn provision(&self, spec: &KernelSpec) -> Result<PreparedKernel, KernelError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(KernelError::WorkerSpawnFailure("host busy".to_string()));
        }
        self.spawner.provision(spec).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pool_recovers_after_refill_gives_up() {
    let mut config = pooled_config(1);
    config.pool.refill.max_retries = 2;
    config.pool.refill.base_delay_ms = 5;
    config.pool.refill.max_delay_ms = 20;

    let provisioner = Arc::new(FlakyProvisioner {
        spawner: KernelSpawner::new(
            Arc::new(engines()),
            InterruptController::new(config.manager.interruption_mode, HostCapabilities::default()),
            Duration::from_secs(5),
        ),
        failures: 3,
        calls: AtomicUsize::new(0),
    });
    let manager = KernelManager::with_provisioner(config, engines(), provisioner.clone());
    manager.initialize_pool();

    // The initial fill uses up every retry.
    let deadline = Instant::now() + Duration::from_secs(5);
    while provisioner.calls.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        manager.get_pool_stats()["in-process:script"],
        PoolStats { available: 0, total: 1 }
    );

    // A miss is served fresh and restarts the refill.
    let first = create(&manager, KernelMode::InProcess).await;
    assert!(!manager.get_kernel(&first).unwrap().from_pool);
    assert_eq!(wait_for_pool(&manager, "in-process:script", 1).await.available, 1);

    let second = create(&manager, KernelMode::InProcess).await;
    assert!(manager.get_kernel(&second).unwrap().from_pool);
    manager.shutdown().await;
}
