//! Worker bridge: an engine hosted on its own thread.
//!
//! The host talks to the worker only through messages. Each execution gets
//! a request id; a router task on the host side forwards worker output to
//! the channel registered for that id, so the remote event sequence is
//! rebuilt locally in order. The interrupt flag handed over at init is the
//! only shared state.

mod protocol;
mod worker;

pub use protocol::{HostMessage, WorkerMessage};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kernelhive_protocols::{
    EngineFactory, EngineInfo, EngineInit, ErrorInfo, InterruptFlag, KernelError,
};

use crate::handle::EngineMessage;

static WORKER_SEQ: AtomicU64 = AtomicU64::new(1);

struct BridgeInner {
    name: String,
    sender: Mutex<Option<Sender<HostMessage>>>,
    pending: DashMap<u64, mpsc::UnboundedSender<EngineMessage>>,
    next_request: AtomicU64,
    terminated: AtomicBool,
    interrupt_buffer: Option<InterruptFlag>,
    info: EngineInfo,
}

impl BridgeInner {
    /// Resolve every in-flight request with an error.
    fn fail_pending(&self, reason: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(EngineMessage::Finished(Err(ErrorInfo::new(
                    "WorkerTerminated",
                    reason,
                ))));
            }
        }
    }

    fn route(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::Output { request_id, output } => {
                if let Some(tx) = self.pending.get(&request_id) {
                    let _ = tx.send(EngineMessage::Output(output));
                }
            }
            WorkerMessage::Completed { request_id, result } => {
                if let Some((_, tx)) = self.pending.remove(&request_id) {
                    let _ = tx.send(EngineMessage::Finished(result));
                }
            }
            other => {
                warn!(worker = %self.name, message = ?other, "Unexpected message from worker");
            }
        }
    }
}

/// Handle to an engine running on a dedicated worker thread.
pub struct WorkerBridge {
    inner: Arc<BridgeInner>,
}

impl WorkerBridge {
    /// Spawn a worker, send the init payload and wait for the ready reply.
    ///
    /// Any failure before ready, including the timeout, is a
    /// [`KernelError::WorkerSpawnFailure`].
    pub async fn spawn(
        factory: Arc<dyn EngineFactory>,
        init: EngineInit,
        interrupt_buffer: Option<InterruptFlag>,
        init_timeout: Duration,
    ) -> Result<Self, KernelError> {
        let name = format!("kernel-worker-{}", WORKER_SEQ.fetch_add(1, Ordering::Relaxed));
        let (host_tx, host_rx) = std::sync::mpsc::channel();
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker::run(factory, host_rx, worker_tx))
            .map_err(|e| KernelError::WorkerSpawnFailure(format!("{}: {}", name, e)))?;

        debug!(worker = %name, language = %init.language, "Worker thread started");

        host_tx
            .send(HostMessage::Init {
                init,
                interrupt_buffer: interrupt_buffer.clone(),
            })
            .map_err(|_| {
                KernelError::WorkerSpawnFailure(format!("{} exited before init", name))
            })?;

        let info = match tokio::time::timeout(init_timeout, worker_rx.recv()).await {
            Ok(Some(WorkerMessage::Ready(info))) => info,
            Ok(Some(WorkerMessage::InitFailed(reason))) => {
                return Err(KernelError::WorkerSpawnFailure(format!("{}: {}", name, reason)));
            }
            Ok(Some(other)) => {
                let _ = host_tx.send(HostMessage::Shutdown);
                return Err(KernelError::WorkerSpawnFailure(format!(
                    "{}: unexpected message before ready: {:?}",
                    name, other
                )));
            }
            Ok(None) => {
                return Err(KernelError::WorkerSpawnFailure(format!(
                    "{} exited before ready",
                    name
                )));
            }
            Err(_) => {
                let _ = host_tx.send(HostMessage::Shutdown);
                return Err(KernelError::WorkerSpawnFailure(format!(
                    "{} not ready within {:?}",
                    name, init_timeout
                )));
            }
        };

        info!(worker = %name, implementation = %info.implementation, "Worker ready");

        let inner = Arc::new(BridgeInner {
            name,
            sender: Mutex::new(Some(host_tx)),
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
            interrupt_buffer,
            info,
        });

        tokio::spawn(run_router(Arc::downgrade(&inner), worker_rx));

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn info(&self) -> &EngineInfo {
        &self.inner.info
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting completion.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Forward an execution to the worker.
    pub fn execute(
        &self,
        code: &str,
    ) -> Result<mpsc::UnboundedReceiver<EngineMessage>, KernelError> {
        if self.is_terminated() {
            return Err(KernelError::WorkerTerminated(self.inner.name.clone()));
        }

        let request_id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.insert(request_id, tx);

        let sent = match self.inner.sender.lock().as_ref() {
            Some(sender) => sender
                .send(HostMessage::Execute {
                    request_id,
                    code: code.to_string(),
                })
                .is_ok(),
            None => false,
        };

        if !sent {
            self.inner.pending.remove(&request_id);
            return Err(KernelError::WorkerTerminated(self.inner.name.clone()));
        }

        debug!(worker = %self.inner.name, request_id, "Execution forwarded");
        Ok(rx)
    }

    /// Terminate the worker unconditionally.
    ///
    /// The running execution is interrupted through the shared flag, the
    /// worker is told to exit, and every pending request resolves with an
    /// error at once instead of waiting for the thread.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(flag) = &self.inner.interrupt_buffer {
            flag.raise();
        }
        if let Some(sender) = self.inner.sender.lock().take() {
            let _ = sender.send(HostMessage::Shutdown);
        }
        self.inner.fail_pending("worker terminated");

        info!(worker = %self.inner.name, "Worker terminated");
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn run_router(inner: Weak<BridgeInner>, mut inbox: mpsc::UnboundedReceiver<WorkerMessage>) {
    while let Some(message) = inbox.recv().await {
        match inner.upgrade() {
            Some(bridge) => bridge.route(message),
            None => return,
        }
    }

    if let Some(bridge) = inner.upgrade() {
        bridge.fail_pending("worker exited");
        if !bridge.terminated.load(Ordering::SeqCst) {
            warn!(worker = %bridge.name, "Worker exited unexpectedly");
        }
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
