//! # KernelHive Core
//!
//! Orchestration of many stateful code-execution kernels.
//!
//! ## Components
//!
//! - [`KernelManager`] - The façade: lifecycle, execution, events, pool
//! - [`KernelRegistry`] - Authoritative map of live kernels
//! - [`PoolManager`] - Pre-warmed idle kernels keyed by (mode, language)
//! - [`WorkerBridge`] - Engine hosted on a dedicated worker thread
//! - [`InterruptController`] - Per-kernel interrupt strategy selection
//! - [`EventMultiplexer`] - Engine callbacks to ordered [`StreamEvent`]s
//!
//! [`StreamEvent`]: kernelhive_protocols::StreamEvent

pub mod bridge;
pub mod direct;
pub mod engines;
pub mod events;
pub mod handle;
pub mod interrupt;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod watchdog;

pub use bridge::WorkerBridge;
pub use direct::DirectHandle;
pub use engines::EngineRegistry;
pub use events::{EventListeners, EventMultiplexer, ExecutionStream, ListenerId, STREAM_BUFFER};
pub use handle::{EngineMessage, KernelHandle, KernelSpawner, PreparedKernel};
pub use interrupt::{HostCapabilities, InterruptController, InterruptPlan, InterruptSignal};
pub use manager::KernelManager;
pub use pool::{KernelProvisioner, PoolKeyConfig, PoolManager, PoolStats};
pub use registry::{KernelInstance, KernelLimits, KernelRegistry};
pub use retry::RetryPolicy;
