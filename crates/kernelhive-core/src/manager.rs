//! Kernel manager façade.
//!
//! Composes the registry, pool, spawner and interrupt controller behind one
//! API. Each manager owns its own state, so several can coexist in one
//! process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::join_all;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tracing::{Instrument, debug, info, info_span, warn};

use kernelhive_config::{Config, PoolConfig};
use kernelhive_protocols::{
    CreateKernelOptions, EngineInit, ErrorInfo, EventKind, ExecutionResult, KernelError,
    KernelInfo, KernelInfoReply, KernelSpec, KernelState, ParentContext, StreamEvent, StreamName,
};

use crate::engines::EngineRegistry;
use crate::events::{EventMultiplexer, ExecutionStream, ListenerId, STREAM_BUFFER};
use crate::handle::{EngineMessage, KernelSpawner, PreparedKernel};
use crate::interrupt::{HostCapabilities, InterruptController};
use crate::pool::{KernelProvisioner, PoolKeyConfig, PoolManager, PoolStats};
use crate::registry::{KernelInstance, KernelLimits, KernelRegistry};
use crate::watchdog::{Reaper, spawn_inactivity_watchdog};

struct ManagerInner {
    config: Config,
    registry: KernelRegistry,
    spawner: Arc<KernelSpawner>,
    pool: PoolManager,
    closed: AtomicBool,
}

/// The public entry point for kernel lifecycle and execution.
#[derive(Clone)]
pub struct KernelManager {
    inner: Arc<ManagerInner>,
}

impl KernelManager {
    /// Build a manager. No background work starts until
    /// [`initialize_pool`](Self::initialize_pool) is called.
    pub fn new(config: Config, engines: EngineRegistry) -> Self {
        Self::build(config, engines, None)
    }

    /// Build a manager whose pool is filled by a custom provisioner.
    pub fn with_provisioner(
        config: Config,
        engines: EngineRegistry,
        provisioner: Arc<dyn KernelProvisioner>,
    ) -> Self {
        Self::build(config, engines, Some(provisioner))
    }

    fn build(
        config: Config,
        engines: EngineRegistry,
        provisioner: Option<Arc<dyn KernelProvisioner>>,
    ) -> Self {
        let interrupts = InterruptController::new(
            config.manager.interruption_mode,
            HostCapabilities::from(&config.host),
        );
        let spawner = Arc::new(KernelSpawner::new(
            Arc::new(engines),
            interrupts,
            config.bridge.init_timeout(),
        ));
        let provisioner =
            provisioner.unwrap_or_else(|| spawner.clone() as Arc<dyn KernelProvisioner>);
        let pool = PoolManager::new(provisioner, config.pool.clone());

        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry: KernelRegistry::new(),
                spawner,
                pool,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn engines(&self) -> &EngineRegistry {
        self.inner.spawner.engines()
    }

    /// Create a kernel and return its id.
    ///
    /// A matching idle pool entry is claimed when available; otherwise a new
    /// engine is started and awaited.
    pub async fn create_kernel(&self, options: CreateKernelOptions) -> Result<String, KernelError> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let spec = KernelSpec::new(
            options.mode.unwrap_or(inner.config.manager.default_mode),
            options
                .language
                .clone()
                .unwrap_or_else(|| inner.config.manager.default_language.clone()),
        );
        inner.check_allowed(&spec)?;

        let id = options
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if inner.registry.contains(&id) {
            return Err(KernelError::IdConflict(id));
        }
        let namespace = options
            .namespace
            .clone()
            .unwrap_or_else(|| inner.config.manager.default_namespace.clone());
        let limits = KernelLimits {
            inactivity_timeout: options
                .inactivity_timeout
                .or_else(|| inner.config.kernel.inactivity_timeout()),
            max_execution_time: options
                .max_execution_time
                .or_else(|| inner.config.kernel.max_execution_time()),
        };

        let pooled = if options.has_custom_init() {
            debug!(key = %spec, "Custom initialization, bypassing pool");
            None
        } else {
            inner.pool.take(&spec)
        };
        let from_pool = pooled.is_some();
        let prepared: PreparedKernel = match pooled {
            Some(kernel) => kernel,
            None => inner.spawner.spawn(&spec, engine_init(&spec, &options)).await?,
        };

        let instance = Arc::new(KernelInstance::new(
            id.clone(),
            namespace,
            prepared,
            from_pool,
            limits,
        ));
        if let Err(rejected) = inner.registry.insert(instance.clone()) {
            rejected.terminate();
            return Err(KernelError::IdConflict(id));
        }
        if inner.closed.load(Ordering::SeqCst) {
            inner.destroy(&id).await;
            return Err(KernelError::ManagerClosed);
        }

        if let Some(timeout) = limits.inactivity_timeout {
            let reaper: Arc<dyn Reaper> = self.inner.clone();
            spawn_inactivity_watchdog(
                Arc::downgrade(&reaper),
                Arc::downgrade(&instance),
                timeout,
                instance.watchdog_token(),
            );
        }

        info!(
            kernel_id = %id,
            mode = %spec.mode,
            language = %spec.language,
            namespace = %instance.namespace,
            from_pool,
            "Kernel created"
        );
        Ok(id)
    }

    /// Snapshot of one kernel, or `None` if unknown.
    pub fn get_kernel(&self, id: &str) -> Option<KernelInfo> {
        self.inner.registry.get(id).map(|k| k.info())
    }

    /// Destroy a kernel. Returns false when the id was not live; destroying
    /// twice is not an error.
    pub async fn destroy_kernel(&self, id: &str) -> bool {
        self.inner.destroy(id).await
    }

    /// Destroy every kernel, or only those in `namespace`, in parallel.
    /// Returns the number destroyed.
    pub async fn destroy_all(&self, namespace: Option<&str>) -> usize {
        self.inner.destroy_all(namespace).await
    }

    pub fn list_kernels(&self, namespace: Option<&str>) -> Vec<KernelInfo> {
        self.inner
            .registry
            .list(namespace)
            .iter()
            .map(|k| k.info())
            .collect()
    }

    /// Run code and collect the whole event stream into one result.
    pub async fn execute(&self, id: &str, code: &str) -> Result<ExecutionResult, KernelError> {
        let mut stream = self.execute_stream(id, code, None).await?;
        let mut result = ExecutionResult {
            success: true,
            ..Default::default()
        };

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Stream(out) => match out.name {
                    StreamName::Stdout => result.stdout.push_str(&out.text),
                    StreamName::Stderr => result.stderr.push_str(&out.text),
                },
                StreamEvent::ExecuteResult(r) => result.result = Some(r.data),
                StreamEvent::ExecuteError(e) => {
                    result.success = false;
                    result.error = Some(e);
                }
                _ => {}
            }
        }

        Ok(result)
    }

    /// Start an execution and return its event stream.
    ///
    /// Executions on one kernel are serialized in arrival order; a caller
    /// waits here until earlier executions on the same kernel finish.
    ///
    /// At most [`STREAM_BUFFER`] events wait for the consumer. Past that the
    /// relay pauses until the stream is polled or dropped, and the kernel
    /// stays busy meanwhile.
    pub async fn execute_stream(
        &self,
        id: &str,
        code: &str,
        parent: Option<ParentContext>,
    ) -> Result<ExecutionStream, KernelError> {
        let instance = self.inner.instance(id)?;
        let slot = instance.exec_slot().lock_owned().await;

        // Armed before going busy, so an interrupt seen as busy is never reset.
        instance.interrupt().arm();
        if !instance.begin_execution() {
            return Err(KernelError::KernelNotFound(id.to_string()));
        }

        let engine_rx = match instance.handle().execute(code) {
            Ok(rx) => rx,
            Err(e) => {
                instance.finish_execution();
                return Err(e);
            }
        };

        let request_id = parent
            .map(|p| p.msg_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let execution_count = instance.events().begin_execution();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let span = info_span!("execution", kernel_id = %id, request_id = %request_id, execution_count);
        tokio::spawn(pump(instance, engine_rx, tx, slot, execution_count).instrument(span));

        Ok(ExecutionStream::new(id, request_id, rx))
    }

    /// Interrupt a kernel's running execution.
    ///
    /// An idle kernel is a successful no-op. For a busy kernel the signal is
    /// delivered and the call waits up to the configured interrupt timeout
    /// for the kernel to return to idle.
    pub async fn interrupt_kernel(&self, id: &str) -> Result<bool, KernelError> {
        let instance = self.inner.instance(id)?;
        if instance.state() != KernelState::Busy {
            debug!(kernel_id = %id, "Interrupt on idle kernel is a no-op");
            return Ok(true);
        }

        let strategy = match instance.interrupt().fire() {
            Ok(strategy) => strategy,
            Err(reason) => {
                let err = KernelError::InterruptUnavailable {
                    kernel_id: id.to_string(),
                    reason,
                };
                warn!(kernel_id = %id, error = %err, "Interrupt not delivered");
                return Ok(false);
            }
        };
        info!(kernel_id = %id, strategy = %strategy, "Interrupt sent");

        let timeout = self.inner.config.kernel.interrupt_timeout();
        let mut state = instance.subscribe_state();
        match tokio::time::timeout(timeout, state.wait_for(|s| *s != KernelState::Busy)).await {
            Ok(Ok(_)) => Ok(true),
            _ => {
                warn!(kernel_id = %id, timeout_ms = timeout.as_millis() as u64, "Kernel still busy after interrupt");
                Ok(false)
            }
        }
    }

    /// Subscribe to one kind of event on one kernel.
    pub fn on_kernel_event<F>(&self, id: &str, kind: EventKind, listener: F) -> Result<ListenerId, KernelError>
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let instance = self.inner.instance(id)?;
        Ok(instance.events().listeners().subscribe(kind, listener))
    }

    /// Remove a subscription. Returns false if the kernel or listener is
    /// unknown.
    pub fn off_kernel_event(&self, id: &str, listener: ListenerId) -> bool {
        self.inner
            .registry
            .get(id)
            .map(|k| k.events().listeners().unsubscribe(listener))
            .unwrap_or(false)
    }

    /// Engine details for a kernel, also published as a `kernel_info` event.
    pub fn kernel_info(&self, id: &str) -> Result<KernelInfoReply, KernelError> {
        let instance = self.inner.instance(id)?;
        let engine = instance.handle().info();
        let reply = KernelInfoReply {
            language: engine.language.clone(),
            implementation: engine.implementation.clone(),
            implementation_version: engine.implementation_version.clone(),
            mode: instance.spec.mode,
        };
        instance
            .events()
            .listeners()
            .dispatch(&StreamEvent::KernelInfo(reply.clone()));
        Ok(reply)
    }

    pub fn get_pool_stats(&self) -> BTreeMap<String, PoolStats> {
        self.inner.pool.stats()
    }

    pub fn get_pool_config(&self) -> PoolConfig {
        self.inner.pool.config().clone()
    }

    /// Settings for one pool key, if configured.
    pub fn get_pool_key_config(&self, spec: &KernelSpec) -> Option<PoolKeyConfig> {
        self.inner.pool.key_config(spec)
    }

    /// Change one pool key's size, refill or enabled flag.
    pub fn configure_pool(&self, spec: &KernelSpec, config: PoolKeyConfig) -> Result<(), KernelError> {
        self.inner.ensure_open()?;
        self.inner.check_allowed(spec)?;
        self.inner.pool.configure(spec, config);
        Ok(())
    }

    /// Start preloading pool entries in the background.
    pub fn initialize_pool(&self) {
        self.inner.pool.initialize();
    }

    /// Close the pool and destroy every kernel. Later calls fail with
    /// [`KernelError::ManagerClosed`].
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pool.close().await;
        let destroyed = self.inner.destroy_all(None).await;
        info!(destroyed, "Kernel manager shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl ManagerInner {
    fn ensure_open(&self) -> Result<(), KernelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KernelError::ManagerClosed);
        }
        Ok(())
    }

    fn check_allowed(&self, spec: &KernelSpec) -> Result<(), KernelError> {
        if self.config.manager.allows(spec) && self.spawner.engines().contains(&spec.language) {
            return Ok(());
        }
        Err(KernelError::UnsupportedKernelType {
            mode: spec.mode,
            language: spec.language.clone(),
        })
    }

    fn instance(&self, id: &str) -> Result<Arc<KernelInstance>, KernelError> {
        self.registry
            .get(id)
            .ok_or_else(|| KernelError::KernelNotFound(id.to_string()))
    }

    async fn destroy(&self, id: &str) -> bool {
        let Some(instance) = self.registry.remove(id) else {
            debug!(kernel_id = %id, "Destroy on unknown kernel is a no-op");
            return false;
        };

        let was_busy = instance.state() == KernelState::Busy;
        instance.mark_destroyed();
        instance.terminate();

        if was_busy {
            let timeout = self.config.kernel.interrupt_timeout();
            if tokio::time::timeout(timeout, instance.exec_slot().lock_owned())
                .await
                .is_err()
            {
                warn!(kernel_id = %id, "Execution still running after destroy");
            }
        }

        info!(kernel_id = %id, namespace = %instance.namespace, "Kernel destroyed");
        true
    }

    async fn destroy_all(&self, namespace: Option<&str>) -> usize {
        let ids: Vec<String> = self
            .registry
            .list(namespace)
            .iter()
            .map(|k| k.id.clone())
            .collect();
        let results = join_all(ids.iter().map(|id| self.destroy(id))).await;
        let destroyed = results.into_iter().filter(|d| *d).count();
        if destroyed < ids.len() {
            warn!(
                expected = ids.len(),
                destroyed,
                "Some kernels were already gone during bulk destroy"
            );
        }
        destroyed
    }
}

#[async_trait]
impl Reaper for ManagerInner {
    async fn reap(&self, kernel_id: &str) {
        self.destroy(kernel_id).await;
    }
}

fn engine_init(spec: &KernelSpec, options: &CreateKernelOptions) -> EngineInit {
    EngineInit {
        language: spec.language.clone(),
        env: options.env.clone(),
        filesystem: options.filesystem.clone(),
        lock_file_url: options.lock_file_url.clone(),
    }
}

/// Holds a kernel's execution slot. Dropping it returns the kernel to idle,
/// however the relay ends.
struct ExecutionGuard {
    instance: Arc<KernelInstance>,
    _slot: OwnedMutexGuard<()>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.instance.finish_execution();
    }
}

/// Relay one execution's engine output to listeners and the stream.
async fn pump(
    instance: Arc<KernelInstance>,
    mut engine_rx: mpsc::UnboundedReceiver<EngineMessage>,
    tx: mpsc::Sender<StreamEvent>,
    slot: OwnedMutexGuard<()>,
    execution_count: u64,
) {
    let _guard = ExecutionGuard {
        instance: instance.clone(),
        _slot: slot,
    };
    let events = instance.events();
    let deadline = instance
        .limits
        .max_execution_time
        .map(|limit| (limit, tokio::time::Instant::now() + limit));
    let mut limit_fired = false;

    loop {
        let message = match deadline {
            Some((limit, at)) if !limit_fired => {
                tokio::select! {
                    message = engine_rx.recv() => message,
                    _ = tokio::time::sleep_until(at) => {
                        limit_fired = true;
                        warn!(limit_ms = limit.as_millis() as u64, "Execution exceeded time limit, interrupting");
                        if let Err(reason) = instance.interrupt().fire() {
                            warn!(%reason, "Time limit interrupt not delivered");
                        }
                        continue;
                    }
                }
            }
            _ => engine_rx.recv().await,
        };

        match message {
            Some(EngineMessage::Output(output)) => {
                events.publish(EventMultiplexer::normalize_output(output), &tx).await;
            }
            Some(EngineMessage::Finished(outcome)) => {
                if let Err(fault) = &outcome {
                    debug!(ename = %fault.ename, "Execution faulted");
                }
                if let Some(event) = EventMultiplexer::normalize_outcome(execution_count, outcome) {
                    events.publish(event, &tx).await;
                }
                break;
            }
            None => {
                let fault = ErrorInfo::new(
                    "KernelTerminated",
                    "kernel terminated before the execution completed",
                );
                events.publish(StreamEvent::ExecuteError(fault), &tx).await;
                break;
            }
        }
    }

    debug!("Execution finished");
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
