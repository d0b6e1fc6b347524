//! # KernelHive Protocols
//!
//! Types shared between the kernel manager and the execution engines it
//! orchestrates.
//!
//! ## Modules
//!
//! - [`event`] - The `StreamEvent` wire union emitted by every execution
//! - [`kernel`] - Kernel identity, mode, state and creation options
//! - [`engine`] - The `ExecutionEngine` / `EngineFactory` seam
//! - [`interrupt`] - Interruption modes and the shared interrupt cell
//! - [`error`] - Error taxonomy

pub mod engine;
pub mod error;
pub mod event;
pub mod interrupt;
pub mod kernel;

pub use engine::{
    EngineFactory, EngineFault, EngineInfo, EngineInit, ExecutionEngine, FilesystemMount,
    InterruptHook, OutputSink, RawOutput,
};
pub use error::{EngineError, KernelError};
pub use event::{
    DisplayData, ErrorInfo, EventKind, ExecuteResult, KernelInfoReply, MimeBundle, StreamEvent,
    StreamName, StreamOutput,
};
pub use interrupt::{InterruptFlag, InterruptStrategy, InterruptionMode};
pub use kernel::{
    CreateKernelOptions, ExecutionRequest, ExecutionResult, KernelInfo, KernelMode, KernelSpec,
    KernelState, ParentContext,
};
