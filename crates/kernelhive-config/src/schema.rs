//! Configuration schema definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use kernelhive_protocols::kernel::DEFAULT_NAMESPACE;
use kernelhive_protocols::{InterruptionMode, KernelMode, KernelSpec};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub kernel: KernelDefaults,
}

/// Kernel manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Allow-list gate on kernel creation. Empty admits every registered
    /// language in both modes.
    #[serde(default)]
    pub allowed_kernel_types: Vec<KernelSpec>,

    #[serde(default)]
    pub interruption_mode: InterruptionMode,

    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    #[serde(default = "default_mode")]
    pub default_mode: KernelMode,

    #[serde(default = "default_language")]
    pub default_language: String,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_mode() -> KernelMode {
    KernelMode::IsolatedWorker
}

fn default_language() -> String {
    "script".to_string()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            allowed_kernel_types: Vec::new(),
            interruption_mode: InterruptionMode::default(),
            default_namespace: default_namespace(),
            default_mode: default_mode(),
            default_language: default_language(),
        }
    }
}

impl ManagerConfig {
    /// Check a (mode, language) pair against the allow-list.
    pub fn allows(&self, spec: &KernelSpec) -> bool {
        self.allowed_kernel_types.is_empty() || self.allowed_kernel_types.contains(spec)
    }
}

/// Host capabilities relevant to interruption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host can allocate memory shared across threads.
    #[serde(default = "default_true")]
    pub shared_memory: bool,

    /// Host context permits sharing that memory with workers.
    #[serde(default = "default_true")]
    pub cross_origin_isolated: bool,
}

fn default_true() -> bool {
    true
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            shared_memory: true,
            cross_origin_isolated: true,
        }
    }
}

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Target idle instances per (mode, language) key.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_true")]
    pub auto_refill: bool,

    /// Keys pre-filled at startup.
    #[serde(default)]
    pub preload: Vec<KernelSpec>,

    #[serde(default)]
    pub refill: RefillConfig,
}

fn default_pool_size() -> usize {
    2
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pool_size: default_pool_size(),
            auto_refill: true,
            preload: Vec::new(),
            refill: RefillConfig::default(),
        }
    }
}

/// Backoff applied to failed pool refills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefillConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RefillConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Worker bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// How long to wait for a worker's ready handshake.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
}

fn default_init_timeout_ms() -> u64 {
    10_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: default_init_timeout_ms(),
        }
    }
}

impl BridgeConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

/// Defaults applied to every kernel unless creation options override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelDefaults {
    #[serde(default)]
    pub inactivity_timeout_secs: Option<u64>,

    #[serde(default)]
    pub max_execution_time_secs: Option<u64>,

    /// How long an interrupt waits for the kernel to go idle.
    #[serde(default = "default_interrupt_timeout_ms")]
    pub interrupt_timeout_ms: u64,
}

fn default_interrupt_timeout_ms() -> u64 {
    2_000
}

impl Default for KernelDefaults {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: None,
            max_execution_time_secs: None,
            interrupt_timeout_ms: default_interrupt_timeout_ms(),
        }
    }
}

impl KernelDefaults {
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout_secs.map(Duration::from_secs)
    }

    pub fn max_execution_time(&self) -> Option<Duration> {
        self.max_execution_time_secs.map(Duration::from_secs)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
