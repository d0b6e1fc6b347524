//! Live kernels and the authoritative id map.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use kernelhive_protocols::{KernelInfo, KernelSpec, KernelState};

use crate::events::EventMultiplexer;
use crate::handle::{KernelHandle, PreparedKernel};
use crate::interrupt::InterruptSignal;

/// Per-kernel time limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelLimits {
    pub inactivity_timeout: Option<Duration>,
    pub max_execution_time: Option<Duration>,
}

/// One live kernel.
pub struct KernelInstance {
    pub id: String,
    pub spec: KernelSpec,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub from_pool: bool,
    pub limits: KernelLimits,
    handle: KernelHandle,
    interrupt: InterruptSignal,
    state: watch::Sender<KernelState>,
    exec_slot: Arc<tokio::sync::Mutex<()>>,
    events: EventMultiplexer,
    last_activity: Mutex<Instant>,
    watchdog: CancellationToken,
}

impl KernelInstance {
    pub fn new(
        id: impl Into<String>,
        namespace: impl Into<String>,
        prepared: PreparedKernel,
        from_pool: bool,
        limits: KernelLimits,
    ) -> Self {
        let (state, _) = watch::channel(KernelState::Idle);
        Self {
            id: id.into(),
            spec: prepared.spec,
            namespace: namespace.into(),
            created_at: Utc::now(),
            from_pool,
            limits,
            handle: prepared.handle,
            interrupt: prepared.interrupt,
            state,
            exec_slot: Arc::new(tokio::sync::Mutex::new(())),
            events: EventMultiplexer::new(),
            last_activity: Mutex::new(Instant::now()),
            watchdog: CancellationToken::new(),
        }
    }

    pub fn info(&self) -> KernelInfo {
        KernelInfo {
            id: self.id.clone(),
            mode: self.spec.mode,
            language: self.spec.language.clone(),
            namespace: self.namespace.clone(),
            created_at: self.created_at,
            state: self.state(),
            from_pool: self.from_pool,
        }
    }

    pub fn handle(&self) -> &KernelHandle {
        &self.handle
    }

    pub fn interrupt(&self) -> &InterruptSignal {
        &self.interrupt
    }

    pub fn events(&self) -> &EventMultiplexer {
        &self.events
    }

    pub fn state(&self) -> KernelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<KernelState> {
        self.state.subscribe()
    }

    /// FIFO slot that serializes executions on this kernel.
    pub fn exec_slot(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.exec_slot.clone()
    }

    pub fn watchdog_token(&self) -> CancellationToken {
        self.watchdog.clone()
    }

    /// `idle -> busy`. Fails once destroyed.
    pub fn begin_execution(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == KernelState::Idle {
                *state = KernelState::Busy;
                true
            } else {
                false
            }
        })
    }

    /// `busy -> idle`, unless the kernel was destroyed meanwhile.
    pub fn finish_execution(&self) {
        self.touch();
        self.state.send_if_modified(|state| {
            if *state == KernelState::Busy {
                *state = KernelState::Idle;
                true
            } else {
                false
            }
        });
    }

    /// Move to the terminal state. Returns false if already destroyed.
    pub fn mark_destroyed(&self) -> bool {
        self.state.send_replace(KernelState::Destroyed) != KernelState::Destroyed
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Stop the engine and any watchdog. The in-flight execution, if any,
    /// is interrupted first.
    pub fn terminate(&self) {
        self.watchdog.cancel();
        let _ = self.interrupt.fire();
        self.handle.terminate();
    }
}

impl fmt::Debug for KernelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelInstance")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("namespace", &self.namespace)
            .field("state", &self.state())
            .field("from_pool", &self.from_pool)
            .finish_non_exhaustive()
    }
}

/// Map of kernel id to live instance.
pub struct KernelRegistry {
    kernels: DashMap<String, Arc<KernelInstance>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            kernels: DashMap::new(),
        }
    }

    /// Insert if the id is free. The rejected instance is handed back.
    pub fn insert(&self, instance: Arc<KernelInstance>) -> Result<(), Arc<KernelInstance>> {
        match self.kernels.entry(instance.id.clone()) {
            Entry::Occupied(_) => Err(instance),
            Entry::Vacant(slot) => {
                slot.insert(instance);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<KernelInstance>> {
        self.kernels.get(id).map(|k| k.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<KernelInstance>> {
        self.kernels.remove(id).map(|(_, k)| k)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.kernels.contains_key(id)
    }

    /// Snapshot of live kernels, optionally filtered by namespace, oldest
    /// first.
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<KernelInstance>> {
        let mut kernels: Vec<Arc<KernelInstance>> = self
            .kernels
            .iter()
            .filter(|k| namespace.is_none_or(|ns| k.namespace == ns))
            .map(|k| k.clone())
            .collect();
        kernels.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        kernels
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
