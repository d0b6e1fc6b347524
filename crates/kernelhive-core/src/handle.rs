//! Mode-agnostic kernel handles.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use kernelhive_protocols::{
    EngineFault, EngineInfo, EngineInit, ErrorInfo, KernelError, KernelMode, KernelSpec,
    MimeBundle, OutputSink, RawOutput,
};

use crate::bridge::WorkerBridge;
use crate::direct::DirectHandle;
use crate::engines::EngineRegistry;
use crate::interrupt::{InterruptController, InterruptSignal};
use crate::pool::KernelProvisioner;

/// One message produced by an engine during an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    Output(RawOutput),
    Finished(Result<Option<MimeBundle>, EngineFault>),
}

/// Sink that forwards engine output over a channel.
pub(crate) struct ChannelSink {
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl ChannelSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<EngineMessage>) -> Self {
        Self { tx }
    }
}

impl OutputSink for ChannelSink {
    fn emit(&mut self, output: RawOutput) {
        let _ = self.tx.send(EngineMessage::Output(output));
    }
}

/// Turn a caught panic payload into an engine fault.
pub(crate) fn panic_fault(ename: &str, payload: Box<dyn Any + Send>) -> ErrorInfo {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "engine panicked".to_string());
    ErrorInfo::new(ename, message)
}

/// The engine behind a kernel: exactly one of in-process or worker.
pub enum KernelHandle {
    Direct(DirectHandle),
    Worker(WorkerBridge),
}

impl KernelHandle {
    pub fn mode(&self) -> KernelMode {
        match self {
            Self::Direct(_) => KernelMode::InProcess,
            Self::Worker(_) => KernelMode::IsolatedWorker,
        }
    }

    pub fn info(&self) -> &EngineInfo {
        match self {
            Self::Direct(h) => h.info(),
            Self::Worker(h) => h.info(),
        }
    }

    /// Start an execution. Output and the final outcome arrive on the
    /// returned channel in production order.
    pub fn execute(&self, code: &str) -> Result<mpsc::UnboundedReceiver<EngineMessage>, KernelError> {
        match self {
            Self::Direct(h) => h.execute(code),
            Self::Worker(h) => h.execute(code),
        }
    }

    /// Stop the engine. In-flight executions end with an error.
    pub fn terminate(&self) {
        match self {
            Self::Direct(h) => h.terminate(),
            Self::Worker(h) => h.terminate(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        match self {
            Self::Direct(h) => h.is_closed(),
            Self::Worker(h) => h.is_terminated(),
        }
    }
}

/// A started engine not yet registered as a kernel.
pub struct PreparedKernel {
    pub spec: KernelSpec,
    pub handle: KernelHandle,
    pub interrupt: InterruptSignal,
}

impl PreparedKernel {
    /// Interrupt anything running and stop the engine.
    pub fn terminate(&self) {
        let _ = self.interrupt.fire();
        self.handle.terminate();
    }
}

/// Builds engines for kernel specs.
pub struct KernelSpawner {
    engines: Arc<EngineRegistry>,
    interrupts: InterruptController,
    init_timeout: Duration,
}

impl KernelSpawner {
    pub fn new(
        engines: Arc<EngineRegistry>,
        interrupts: InterruptController,
        init_timeout: Duration,
    ) -> Self {
        Self {
            engines,
            interrupts,
            init_timeout,
        }
    }

    pub fn engines(&self) -> &Arc<EngineRegistry> {
        &self.engines
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    /// Start an engine for `spec` with the given initialization payload.
    pub async fn spawn(&self, spec: &KernelSpec, init: EngineInit) -> Result<PreparedKernel, KernelError> {
        let factory = self
            .engines
            .get(&spec.language)
            .ok_or_else(|| KernelError::UnsupportedKernelType {
                mode: spec.mode,
                language: spec.language.clone(),
            })?;

        let plan = self.interrupts.plan(spec.mode);
        let flag = plan.shared_flag();

        let (handle, interrupt) = match spec.mode {
            KernelMode::InProcess => {
                let direct = DirectHandle::create(factory, init, flag).await?;
                let interrupt = InterruptSignal::new(plan, direct.hook());
                (KernelHandle::Direct(direct), interrupt)
            }
            KernelMode::IsolatedWorker => {
                let bridge = WorkerBridge::spawn(factory, init, flag, self.init_timeout).await?;
                (KernelHandle::Worker(bridge), InterruptSignal::new(plan, None))
            }
        };

        info!(
            key = %spec,
            implementation = %handle.info().implementation,
            interrupt = ?interrupt.strategy(),
            "Engine started"
        );

        Ok(PreparedKernel {
            spec: spec.clone(),
            handle,
            interrupt,
        })
    }
}

#[async_trait]
impl KernelProvisioner for KernelSpawner {
    async fn provision(&self, spec: &KernelSpec) -> Result<PreparedKernel, KernelError> {
        self.spawn(spec, EngineInit::new(spec.language.clone())).await
    }
}
