//! Interruption modes and the shared interrupt cell.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use serde::{Deserialize, Serialize};

/// Value stored in the cell to request an interrupt.
pub const SIGINT: i32 = 2;

/// Configured interruption mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterruptionMode {
    /// Shared flag cell polled by the engine.
    SharedMemory,
    /// Engine interrupt entry point invoked by the host.
    DirectCall,
    /// Shared memory when the host supports it, else direct call.
    #[default]
    Auto,
}

/// Strategy actually in use for a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterruptStrategy {
    SharedMemory,
    DirectCall,
}

impl fmt::Display for InterruptStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedMemory => f.write_str("shared-memory"),
            Self::DirectCall => f.write_str("direct-call"),
        }
    }
}

/// Interrupt cell shared between the host and a running engine.
///
/// This is the only piece of kernel state touched by more than one thread
/// without message passing.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    cell: Arc<AtomicI32>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an interrupt.
    pub fn raise(&self) {
        self.cell.store(SIGINT, Ordering::SeqCst);
    }

    /// Check for a pending interrupt without consuming it.
    pub fn is_raised(&self) -> bool {
        self.cell.load(Ordering::SeqCst) == SIGINT
    }

    /// Consume a pending interrupt. Returns true if one was pending.
    pub fn take(&self) -> bool {
        self.cell.swap(0, Ordering::SeqCst) == SIGINT
    }

    /// Reset the cell.
    pub fn clear(&self) {
        self.cell.store(0, Ordering::SeqCst);
    }

    /// Whether two handles point at the same cell.
    pub fn same_cell(&self, other: &InterruptFlag) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}
