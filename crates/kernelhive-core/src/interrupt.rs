//! Interrupt strategy selection and per-kernel interrupt channels.
//!
//! Every kernel gets its own channel so interrupting one kernel never touches
//! another. The shared-memory strategy allocates a fresh [`InterruptFlag`]
//! per kernel; the direct-call strategy holds the engine's own hook.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use kernelhive_config::HostConfig;
use kernelhive_protocols::{
    InterruptFlag, InterruptHook, InterruptStrategy, InterruptionMode, KernelMode,
};

/// What the host can offer for interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    pub shared_memory: bool,
    pub cross_origin_isolated: bool,
}

impl HostCapabilities {
    /// Shared-memory flags need both buffer support and an isolated context.
    pub fn supports_shared_memory(&self) -> bool {
        self.shared_memory && self.cross_origin_isolated
    }
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self {
            shared_memory: true,
            cross_origin_isolated: true,
        }
    }
}

impl From<&HostConfig> for HostCapabilities {
    fn from(config: &HostConfig) -> Self {
        Self {
            shared_memory: config.shared_memory,
            cross_origin_isolated: config.cross_origin_isolated,
        }
    }
}

/// Strategy chosen for one kernel before its engine exists.
#[derive(Debug, Clone)]
pub enum InterruptPlan {
    /// Poll a shared flag. The flag must be installed in the engine.
    SharedMemory(InterruptFlag),
    /// Call the engine's interrupt hook.
    DirectCall,
    /// No strategy can reach this kernel.
    Unavailable(String),
}

impl InterruptPlan {
    /// The flag to install in the engine, if any.
    pub fn shared_flag(&self) -> Option<InterruptFlag> {
        match self {
            Self::SharedMemory(flag) => Some(flag.clone()),
            _ => None,
        }
    }
}

/// Selects interrupt strategies from configuration and host capabilities.
#[derive(Debug, Clone)]
pub struct InterruptController {
    mode: InterruptionMode,
    host: HostCapabilities,
}

impl InterruptController {
    pub fn new(mode: InterruptionMode, host: HostCapabilities) -> Self {
        if mode == InterruptionMode::SharedMemory && !host.supports_shared_memory() {
            warn!(
                shared_memory = host.shared_memory,
                cross_origin_isolated = host.cross_origin_isolated,
                "Shared-memory interruption requested but unsupported by host, falling back"
            );
        }
        Self { mode, host }
    }

    pub fn mode(&self) -> InterruptionMode {
        self.mode
    }

    pub fn host(&self) -> HostCapabilities {
        self.host
    }

    /// Plan the interrupt channel for a kernel of the given mode.
    ///
    /// Direct calls cannot cross a worker boundary, so isolated workers rely
    /// on shared memory whatever the configured mode says.
    pub fn plan(&self, kernel_mode: KernelMode) -> InterruptPlan {
        let shared = self.host.supports_shared_memory();

        let plan = match (self.mode, kernel_mode) {
            (InterruptionMode::DirectCall, KernelMode::InProcess) => InterruptPlan::DirectCall,
            (_, _) if shared => InterruptPlan::SharedMemory(InterruptFlag::new()),
            (_, KernelMode::InProcess) => InterruptPlan::DirectCall,
            (_, KernelMode::IsolatedWorker) => InterruptPlan::Unavailable(
                "host lacks shared memory and direct calls cannot reach a worker".to_string(),
            ),
        };

        debug!(mode = ?self.mode, kernel_mode = %kernel_mode, plan = ?plan, "Planned interrupt channel");
        plan
    }
}

enum Channel {
    SharedMemory(InterruptFlag),
    DirectCall(Arc<dyn InterruptHook>),
    Unavailable(String),
}

/// A kernel's interrupt channel, cheap to clone.
#[derive(Clone)]
pub struct InterruptSignal {
    channel: Arc<Channel>,
}

impl InterruptSignal {
    /// Resolve a plan once the engine exists.
    pub fn new(plan: InterruptPlan, hook: Option<Arc<dyn InterruptHook>>) -> Self {
        let channel = match (plan, hook) {
            (InterruptPlan::SharedMemory(flag), _) => Channel::SharedMemory(flag),
            (InterruptPlan::DirectCall, Some(hook)) => Channel::DirectCall(hook),
            (InterruptPlan::DirectCall, None) => {
                Channel::Unavailable("engine exposes no interrupt entry point".to_string())
            }
            (InterruptPlan::Unavailable(reason), _) => Channel::Unavailable(reason),
        };
        Self {
            channel: Arc::new(channel),
        }
    }

    /// A signal that can never fire.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            channel: Arc::new(Channel::Unavailable(reason.into())),
        }
    }

    pub fn strategy(&self) -> Option<InterruptStrategy> {
        match self.channel.as_ref() {
            Channel::SharedMemory(_) => Some(InterruptStrategy::SharedMemory),
            Channel::DirectCall(_) => Some(InterruptStrategy::DirectCall),
            Channel::Unavailable(_) => None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.strategy().is_some()
    }

    /// Clear a stale request before a new execution is dispatched. An
    /// interrupt fired after this point reaches the execution even if the
    /// engine has not started running it yet.
    pub fn arm(&self) {
        match self.channel.as_ref() {
            Channel::SharedMemory(flag) => flag.clear(),
            Channel::DirectCall(hook) => hook.reset(),
            Channel::Unavailable(_) => {}
        }
    }

    /// Deliver an interrupt. Returns the reason when no channel exists.
    pub fn fire(&self) -> Result<InterruptStrategy, String> {
        match self.channel.as_ref() {
            Channel::SharedMemory(flag) => {
                flag.raise();
                Ok(InterruptStrategy::SharedMemory)
            }
            Channel::DirectCall(hook) => {
                hook.raise_interrupt();
                Ok(InterruptStrategy::DirectCall)
            }
            Channel::Unavailable(reason) => Err(reason.clone()),
        }
    }

    /// The shared flag, when the shared-memory strategy is in use.
    pub fn flag(&self) -> Option<&InterruptFlag> {
        match self.channel.as_ref() {
            Channel::SharedMemory(flag) => Some(flag),
            _ => None,
        }
    }
}

impl fmt::Debug for InterruptSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel.as_ref() {
            Channel::SharedMemory(_) => f.write_str("InterruptSignal(shared-memory)"),
            Channel::DirectCall(_) => f.write_str("InterruptSignal(direct-call)"),
            Channel::Unavailable(reason) => write!(f, "InterruptSignal(unavailable: {})", reason),
        }
    }
}

#[cfg(test)]
#[path = "interrupt_tests.rs"]
mod tests;
