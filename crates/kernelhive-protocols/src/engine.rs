//! Execution engine seam.
//!
//! The engine that actually runs code is an external collaborator. KernelHive
//! only needs it to accept code, report output through an [`OutputSink`], and
//! honour an interrupt request at its own safe points.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::event::{ErrorInfo, MimeBundle};
use crate::interrupt::InterruptFlag;

/// A filesystem mount passed through to the engine at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemMount {
    /// Host-side path or URL.
    pub source: String,
    /// Path inside the engine's filesystem.
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Initialization handed to an [`EngineFactory`]. For isolated kernels this
/// is the payload of the worker bridge handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInit {
    pub language: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub filesystem: Vec<FilesystemMount>,
    #[serde(default)]
    pub lock_file_url: Option<String>,
}

impl EngineInit {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            ..Default::default()
        }
    }
}

/// Static description of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub language: String,
    pub implementation: String,
    pub implementation_version: String,
}

/// Raw output callback from an engine, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    Stdout(String),
    Stderr(String),
    Display {
        data: MimeBundle,
        metadata: MimeBundle,
        display_id: Option<String>,
    },
    UpdateDisplay {
        data: MimeBundle,
        metadata: MimeBundle,
        display_id: String,
    },
}

/// A fault raised by code under execution.
pub type EngineFault = ErrorInfo;

/// Receives engine output in production order.
pub trait OutputSink {
    fn emit(&mut self, output: RawOutput);

    fn stdout(&mut self, text: &str) {
        self.emit(RawOutput::Stdout(text.to_string()));
    }

    fn stderr(&mut self, text: &str) {
        self.emit(RawOutput::Stderr(text.to_string()));
    }
}

impl OutputSink for Vec<RawOutput> {
    fn emit(&mut self, output: RawOutput) {
        self.push(output);
    }
}

/// Engine-provided entry point that raises an interrupt inside running code
/// at its next check.
pub trait InterruptHook: Send + Sync {
    fn raise_interrupt(&self);

    /// Drop a request that running code has not observed yet. Called before
    /// each execution is dispatched, never from inside one.
    fn reset(&self);
}

/// A stateful code-execution engine.
///
/// An engine executes one request at a time and is driven from a single
/// thread: a worker thread for isolated kernels, the blocking pool for
/// in-process kernels.
pub trait ExecutionEngine: Send {
    /// Describe the engine.
    fn info(&self) -> EngineInfo;

    /// Install the shared interrupt cell polled at safe points.
    fn set_interrupt_buffer(&mut self, flag: InterruptFlag);

    /// Direct-call interrupt entry point, if the engine has one.
    fn interrupt_hook(&self) -> Option<Arc<dyn InterruptHook>> {
        None
    }

    /// Execute code, streaming output into `sink`.
    ///
    /// Returns the value of the execution, if any, or the fault raised by the
    /// code. Faults are data: the engine stays usable afterwards.
    fn execute(
        &mut self,
        code: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<Option<MimeBundle>, EngineFault>;
}

/// Builds engines for one language.
pub trait EngineFactory: Send + Sync {
    /// Language served by this factory.
    fn language(&self) -> &str;

    /// Create a fresh engine instance.
    fn create(&self, init: &EngineInit) -> Result<Box<dyn ExecutionEngine>, EngineError>;
}
