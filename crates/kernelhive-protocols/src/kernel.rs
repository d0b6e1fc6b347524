//! Kernel identity, mode, state and creation options.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::FilesystemMount;
use crate::error::KernelError;
use crate::event::{ErrorInfo, MimeBundle};

/// Namespace used when a caller does not choose one.
pub const DEFAULT_NAMESPACE: &str = "global";

/// Where a kernel's engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KernelMode {
    /// Engine runs inside the host process, on the host's blocking pool.
    #[serde(rename = "in-process", alias = "main-thread")]
    InProcess,
    /// Engine runs on its own worker thread behind the worker bridge.
    #[serde(rename = "isolated-worker", alias = "worker")]
    IsolatedWorker,
}

impl KernelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in-process",
            Self::IsolatedWorker => "isolated-worker",
        }
    }
}

impl fmt::Display for KernelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KernelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-process" | "main-thread" => Ok(Self::InProcess),
            "isolated-worker" | "worker" => Ok(Self::IsolatedWorker),
            other => Err(format!("unknown kernel mode: {}", other)),
        }
    }
}

/// A (mode, language) pair. Keys the allow-list and the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelSpec {
    pub mode: KernelMode,
    pub language: String,
}

impl KernelSpec {
    pub fn new(mode: KernelMode, language: impl Into<String>) -> Self {
        Self {
            mode,
            language: language.into(),
        }
    }
}

impl fmt::Display for KernelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mode, self.language)
    }
}

/// Kernel execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum KernelState {
    /// Ready for an execution.
    Idle = 0,
    /// An execution is in flight.
    Busy = 1,
    /// Terminal.
    Destroyed = 2,
}

impl From<u8> for KernelState {
    fn from(v: u8) -> Self {
        match v {
            0 => KernelState::Idle,
            1 => KernelState::Busy,
            _ => KernelState::Destroyed,
        }
    }
}

/// Options accepted by kernel creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateKernelOptions {
    /// Explicit kernel id. Generated when absent.
    pub id: Option<String>,
    /// Execution mode. Falls back to the manager default.
    pub mode: Option<KernelMode>,
    /// Language. Falls back to the manager default.
    #[serde(alias = "lang")]
    pub language: Option<String>,
    /// Grouping key for listing and bulk teardown.
    pub namespace: Option<String>,
    /// Environment passed through to the engine.
    pub env: HashMap<String, String>,
    /// Filesystem mounts passed through to the engine.
    pub filesystem: Vec<FilesystemMount>,
    /// Lock file / package version reference passed through to the engine.
    pub lock_file_url: Option<String>,
    /// Destroy the kernel after it has been idle this long.
    #[serde(with = "opt_duration_secs")]
    pub inactivity_timeout: Option<Duration>,
    /// Interrupt executions that run longer than this.
    #[serde(with = "opt_duration_secs")]
    pub max_execution_time: Option<Duration>,
}

impl CreateKernelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_mode(mut self, mode: KernelMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_mount(mut self, mount: FilesystemMount) -> Self {
        self.filesystem.push(mount);
        self
    }

    pub fn with_lock_file_url(mut self, url: impl Into<String>) -> Self {
        self.lock_file_url = Some(url.into());
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = Some(limit);
        self
    }

    /// Whether the request carries engine initialization overrides.
    ///
    /// Pooled kernels are built with default initialization, so such
    /// requests cannot be served from the pool.
    pub fn has_custom_init(&self) -> bool {
        !self.env.is_empty() || !self.filesystem.is_empty() || self.lock_file_url.is_some()
    }
}

/// Snapshot of a live kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub id: String,
    pub mode: KernelMode,
    pub language: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub state: KernelState,
    pub from_pool: bool,
}

/// Correlation data for nested or streamed calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentContext {
    pub msg_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl ParentContext {
    pub fn new(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            session: None,
        }
    }
}

/// A single execution request. Owned by the call that issues it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub kernel_id: String,
    pub code: String,
    pub parent: Option<ParentContext>,
}

impl ExecutionRequest {
    pub fn new(kernel_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            code: code.into(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentContext) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Aggregate result of a drained execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MimeBundle>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ExecutionResult {
    /// Convert a failed result into [`KernelError::ExecutionError`].
    pub fn into_result(self) -> Result<Self, KernelError> {
        match (self.success, self.error.clone()) {
            (false, Some(error)) => Err(KernelError::ExecutionError(error)),
            (false, None) => Err(KernelError::ExecutionError(ErrorInfo::new(
                "ExecutionError",
                "execution did not complete",
            ))),
            _ => Ok(self),
        }
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64))
    }
}
