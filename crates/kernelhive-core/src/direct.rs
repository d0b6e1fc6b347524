//! In-process engines.
//!
//! The engine lives on the host and each execution runs on Tokio's blocking
//! pool, so a long computation never stalls the async runtime. Panics are
//! caught and reported as `execute_error` outcomes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use kernelhive_protocols::{
    EngineError, EngineFactory, EngineInfo, EngineInit, ErrorInfo, ExecutionEngine,
    InterruptFlag, InterruptHook, KernelError,
};

use crate::handle::{ChannelSink, EngineMessage, panic_fault};

/// Handle to an engine running in the host process.
pub struct DirectHandle {
    engine: Arc<Mutex<Box<dyn ExecutionEngine>>>,
    hook: Option<Arc<dyn InterruptHook>>,
    info: EngineInfo,
    closed: Arc<AtomicBool>,
}

impl DirectHandle {
    /// Build the engine on the blocking pool and install the shared flag.
    pub async fn create(
        factory: Arc<dyn EngineFactory>,
        init: EngineInit,
        interrupt_buffer: Option<InterruptFlag>,
    ) -> Result<Self, KernelError> {
        let language = init.language.clone();
        let built = tokio::task::spawn_blocking(move || {
            catch_unwind(AssertUnwindSafe(|| factory.create(&init)))
        })
        .await
        .map_err(|e| EngineError::CreationFailed(e.to_string()))?;

        let mut engine = match built {
            Ok(result) => result?,
            Err(payload) => {
                let fault = panic_fault("EnginePanic", payload);
                return Err(EngineError::Panicked(fault.evalue).into());
            }
        };

        if let Some(flag) = interrupt_buffer {
            engine.set_interrupt_buffer(flag);
        }
        let hook = engine.interrupt_hook();
        let info = engine.info();
        debug!(language = %language, implementation = %info.implementation, "In-process engine created");

        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            hook,
            info,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn info(&self) -> &EngineInfo {
        &self.info
    }

    /// The engine's direct-call interrupt entry point.
    pub fn hook(&self) -> Option<Arc<dyn InterruptHook>> {
        self.hook.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn execute(
        &self,
        code: &str,
    ) -> Result<mpsc::UnboundedReceiver<EngineMessage>, KernelError> {
        if self.is_closed() {
            return Err(KernelError::WorkerTerminated(format!(
                "{} engine is closed",
                self.info.language
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.engine.clone();
        let closed = self.closed.clone();
        let code = code.to_string();

        tokio::task::spawn_blocking(move || {
            let mut engine = engine.lock();
            if closed.load(Ordering::SeqCst) {
                let _ = tx.send(EngineMessage::Finished(Err(ErrorInfo::new(
                    "KernelTerminated",
                    "kernel was destroyed before the execution started",
                ))));
                return;
            }

            let mut sink = ChannelSink::new(tx.clone());
            let outcome = catch_unwind(AssertUnwindSafe(|| engine.execute(&code, &mut sink)));
            let result = outcome.unwrap_or_else(|payload| Err(panic_fault("EnginePanic", payload)));
            let _ = tx.send(EngineMessage::Finished(result));
        });

        Ok(rx)
    }

    /// Refuse further executions and interrupt the running one.
    pub fn terminate(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = &self.hook {
            hook.raise_interrupt();
        }
        debug!(language = %self.info.language, "In-process engine closed");
    }
}

#[cfg(test)]
#[path = "direct_tests.rs"]
mod tests;
