//! Pool of pre-created idle kernels keyed by (mode, language).
//!
//! `total` per key is the configured target and changes only through
//! configuration. `available` counts ready, unclaimed entries; kernels still
//! being provisioned are tracked separately as pending, so `available` never
//! exceeds `total`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use kernelhive_config::PoolConfig;
use kernelhive_protocols::{KernelError, KernelSpec};

use crate::handle::PreparedKernel;
use crate::retry::RetryPolicy;

/// Creates the kernels that fill the pool.
#[async_trait]
pub trait KernelProvisioner: Send + Sync {
    async fn provision(&self, spec: &KernelSpec) -> Result<PreparedKernel, KernelError>;
}

/// Pool settings for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolKeyConfig {
    pub pool_size: usize,
    pub auto_refill: bool,
    pub enabled: bool,
}

impl From<&PoolConfig> for PoolKeyConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            auto_refill: config.auto_refill,
            enabled: config.enabled,
        }
    }
}

/// Observable pool counters for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub total: usize,
}

struct PoolSlot {
    config: PoolKeyConfig,
    idle: VecDeque<PreparedKernel>,
    pending: usize,
}

impl PoolSlot {
    fn new(config: PoolKeyConfig) -> Self {
        Self {
            config,
            idle: VecDeque::new(),
            pending: 0,
        }
    }

    fn target(&self) -> usize {
        if self.config.enabled {
            self.config.pool_size
        } else {
            0
        }
    }

    fn deficit(&self) -> usize {
        self.target().saturating_sub(self.idle.len() + self.pending)
    }
}

struct PoolInner {
    provisioner: Arc<dyn KernelProvisioner>,
    config: PoolConfig,
    retry: RetryPolicy,
    slots: Mutex<HashMap<KernelSpec, PoolSlot>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl PoolInner {
    /// Place a freshly provisioned kernel, or terminate it if it is surplus.
    fn accept(&self, spec: &KernelSpec, kernel: PreparedKernel) {
        let surplus = {
            let mut slots = self.slots.lock();
            match slots.get_mut(spec) {
                Some(slot) => {
                    slot.pending = slot.pending.saturating_sub(1);
                    if self.closed.load(Ordering::SeqCst) || slot.idle.len() >= slot.target() {
                        Some(kernel)
                    } else {
                        slot.idle.push_back(kernel);
                        debug!(key = %spec, available = slot.idle.len(), "Pool entry ready");
                        None
                    }
                }
                None => Some(kernel),
            }
        };

        if let Some(kernel) = surplus {
            debug!(key = %spec, "Discarding surplus pool entry");
            kernel.terminate();
        }
    }

    fn abandon(&self, spec: &KernelSpec) {
        if let Some(slot) = self.slots.lock().get_mut(spec) {
            slot.pending = slot.pending.saturating_sub(1);
        }
    }
}

/// Pre-warmed kernel pool.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl PoolManager {
    pub fn new(provisioner: Arc<dyn KernelProvisioner>, config: PoolConfig) -> Self {
        let retry = RetryPolicy::from(&config.refill);
        Self::with_retry(provisioner, config, retry)
    }

    /// Build a pool with an explicit refill backoff policy.
    pub fn with_retry(
        provisioner: Arc<dyn KernelProvisioner>,
        config: PoolConfig,
        retry: RetryPolicy,
    ) -> Self {
        let mut slots = HashMap::new();
        for spec in &config.preload {
            slots.insert(spec.clone(), PoolSlot::new(PoolKeyConfig::from(&config)));
        }

        Self {
            inner: Arc::new(PoolInner {
                provisioner,
                config,
                retry,
                slots: Mutex::new(slots),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// The pool configuration the manager was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// False once the pool is closed.
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Current settings for one key.
    pub fn key_config(&self, spec: &KernelSpec) -> Option<PoolKeyConfig> {
        self.inner.slots.lock().get(spec).map(|s| s.config)
    }

    /// Start filling every preloaded key in the background.
    ///
    /// Each key fills independently; a failing key does not hold up others.
    /// Must be called within a Tokio runtime.
    pub fn initialize(&self) {
        if !self.is_open() {
            return;
        }
        let keys: Vec<KernelSpec> = self
            .inner
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.config.enabled)
            .map(|(spec, _)| spec.clone())
            .collect();
        if keys.is_empty() {
            debug!("No enabled pool keys, skipping preload");
            return;
        }
        info!(keys = keys.len(), pool_size = self.inner.config.pool_size, "Initializing kernel pool");
        for spec in keys {
            self.refill(&spec);
        }
    }

    /// Claim one idle kernel. Misses when the key is disabled or unknown.
    ///
    /// With auto-refill on, every take of an enabled key tops it back up, so
    /// a key whose earlier refill gave up recovers on the next miss.
    pub fn take(&self, spec: &KernelSpec) -> Option<PreparedKernel> {
        if !self.is_open() {
            return None;
        }

        let (kernel, auto_refill) = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.get_mut(spec)?;
            if !slot.config.enabled {
                return None;
            }
            (slot.idle.pop_front(), slot.config.auto_refill)
        };

        match &kernel {
            Some(_) => debug!(key = %spec, "Pool hit"),
            None => debug!(key = %spec, "Pool miss"),
        }
        if auto_refill {
            self.refill(spec);
        }
        kernel
    }

    /// Top a key up to its target in the background, retrying failures with
    /// backoff. Must be called within a Tokio runtime.
    pub fn refill(&self, spec: &KernelSpec) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let deficit = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(spec) else {
                return;
            };
            let deficit = slot.deficit();
            slot.pending += deficit;
            deficit
        };

        if deficit == 0 {
            return;
        }
        debug!(key = %spec, deficit, "Scheduling pool refill");

        for _ in 0..deficit {
            let inner = self.inner.clone();
            let spec = spec.clone();
            self.inner.tasks.spawn(refill_one(inner, spec));
        }
    }

    /// Counters for every configured key, keyed by `mode:language`.
    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.inner
            .slots
            .lock()
            .iter()
            .map(|(spec, slot)| {
                (
                    spec.to_string(),
                    PoolStats {
                        available: slot.idle.len(),
                        total: slot.target(),
                    },
                )
            })
            .collect()
    }

    pub fn key_stats(&self, spec: &KernelSpec) -> Option<PoolStats> {
        self.inner.slots.lock().get(spec).map(|slot| PoolStats {
            available: slot.idle.len(),
            total: slot.target(),
        })
    }

    /// Change one key's settings. Shrinking terminates surplus idle entries;
    /// growing schedules a refill.
    pub fn configure(&self, spec: &KernelSpec, config: PoolKeyConfig) {
        let surplus: Vec<PreparedKernel> = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .entry(spec.clone())
                .or_insert_with(|| PoolSlot::new(config));
            slot.config = config;
            let target = slot.target();
            let mut surplus = Vec::new();
            while slot.idle.len() > target {
                if let Some(kernel) = slot.idle.pop_back() {
                    surplus.push(kernel);
                }
            }
            surplus
        };

        info!(
            key = %spec,
            pool_size = config.pool_size,
            enabled = config.enabled,
            auto_refill = config.auto_refill,
            released = surplus.len(),
            "Pool key configured"
        );
        for kernel in surplus {
            kernel.terminate();
        }
        self.refill(spec);
    }

    /// Stop refilling and terminate every idle entry.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        let drained: Vec<PreparedKernel> = {
            let mut slots = self.inner.slots.lock();
            slots.values_mut().flat_map(|slot| slot.idle.drain(..)).collect()
        };
        let count = drained.len();
        for kernel in drained {
            kernel.terminate();
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!(terminated = count, "Kernel pool closed");
    }
}

async fn refill_one(inner: Arc<PoolInner>, spec: KernelSpec) {
    let mut attempt = 0u32;
    loop {
        let outcome = tokio::select! {
            _ = inner.shutdown.cancelled() => {
                inner.abandon(&spec);
                return;
            }
            outcome = inner.provisioner.provision(&spec) => outcome,
        };

        let reason = match outcome {
            Ok(kernel) => {
                inner.accept(&spec, kernel);
                return;
            }
            Err(e) => e.to_string(),
        };

        if !inner.retry.should_retry(attempt) {
            let failure = KernelError::PoolRefillFailure {
                key: spec.to_string(),
                reason,
            };
            error!(key = %spec, attempts = attempt + 1, error = %failure, "Pool refill gave up");
            inner.abandon(&spec);
            return;
        }

        let delay = inner.retry.delay_for_attempt(attempt);
        warn!(key = %spec, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %reason, "Pool refill failed, retrying");
        attempt += 1;

        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                inner.abandon(&spec);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
