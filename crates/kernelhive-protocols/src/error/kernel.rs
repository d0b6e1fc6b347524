//! Kernel manager errors.

use thiserror::Error;

use super::engine::EngineError;
use crate::event::ErrorInfo;
use crate::kernel::KernelMode;

#[derive(Debug, Clone, Error)]
pub enum KernelError {
    /// Creation rejected by the allow-list or no engine serves the language.
    #[error("Unsupported kernel type: {mode}:{language}")]
    UnsupportedKernelType { mode: KernelMode, language: String },

    /// The id is unknown or was destroyed.
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    /// An explicit id collides with a live kernel.
    #[error("Kernel id already in use: {0}")]
    IdConflict(String),

    /// An isolated kernel failed to come up.
    #[error("Worker spawn failed: {0}")]
    WorkerSpawnFailure(String),

    /// The kernel's worker or engine was torn down.
    #[error("Kernel terminated: {0}")]
    WorkerTerminated(String),

    /// Code under execution faulted.
    #[error("Execution failed: {0}")]
    ExecutionError(ErrorInfo),

    /// The kernel's interrupt channel cannot deliver an interrupt.
    #[error("Interrupt unavailable for kernel {kernel_id}: {reason}")]
    InterruptUnavailable { kernel_id: String, reason: String },

    /// A pool refill could not create a replacement.
    #[error("Pool refill failed for {key}: {reason}")]
    PoolRefillFailure { key: String, reason: String },

    /// The manager has been shut down.
    #[error("Kernel manager is shut down")]
    ManagerClosed,

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl KernelError {
    /// Structural errors are surfaced to the caller immediately; the rest are
    /// contained by the manager.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedKernelType { .. } | Self::KernelNotFound(_) | Self::IdConflict(_)
        )
    }
}
