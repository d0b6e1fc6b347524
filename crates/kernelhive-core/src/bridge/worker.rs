//! Worker-thread side of the bridge.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::Receiver;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use kernelhive_protocols::{EngineFactory, OutputSink, RawOutput};

use super::protocol::{HostMessage, WorkerMessage};
use crate::handle::panic_fault;

struct WorkerSink<'a> {
    request_id: u64,
    outbox: &'a UnboundedSender<WorkerMessage>,
}

impl OutputSink for WorkerSink<'_> {
    fn emit(&mut self, output: RawOutput) {
        let _ = self.outbox.send(WorkerMessage::Output {
            request_id: self.request_id,
            output,
        });
    }
}

/// Worker main loop. Returns when the host shuts the worker down or drops
/// its end of the channel.
pub(crate) fn run(
    factory: Arc<dyn EngineFactory>,
    inbox: Receiver<HostMessage>,
    outbox: UnboundedSender<WorkerMessage>,
) {
    let (init, interrupt_buffer) = match inbox.recv() {
        Ok(HostMessage::Init {
            init,
            interrupt_buffer,
        }) => (init, interrupt_buffer),
        Ok(other) => {
            let _ = outbox.send(WorkerMessage::InitFailed(format!(
                "expected init message, got {:?}",
                other
            )));
            return;
        }
        Err(_) => return,
    };

    let created = catch_unwind(AssertUnwindSafe(|| factory.create(&init)));
    let mut engine = match created {
        Ok(Ok(engine)) => engine,
        Ok(Err(e)) => {
            let _ = outbox.send(WorkerMessage::InitFailed(e.to_string()));
            return;
        }
        Err(payload) => {
            let fault = panic_fault("WorkerPanic", payload);
            let _ = outbox.send(WorkerMessage::InitFailed(format!(
                "engine panicked during init: {}",
                fault.evalue
            )));
            return;
        }
    };

    if let Some(flag) = interrupt_buffer {
        engine.set_interrupt_buffer(flag);
    }
    if outbox.send(WorkerMessage::Ready(engine.info())).is_err() {
        return;
    }

    while let Ok(message) = inbox.recv() {
        match message {
            HostMessage::Execute { request_id, code } => {
                let mut sink = WorkerSink {
                    request_id,
                    outbox: &outbox,
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| engine.execute(&code, &mut sink)));
                let result = outcome.unwrap_or_else(|payload| {
                    let fault = panic_fault("WorkerPanic", payload);
                    warn!(request_id, error = %fault, "Engine panicked inside worker");
                    Err(fault)
                });
                if outbox
                    .send(WorkerMessage::Completed { request_id, result })
                    .is_err()
                {
                    break;
                }
            }
            HostMessage::Shutdown => break,
            HostMessage::Init { .. } => {
                warn!("Ignoring repeated init message");
            }
        }
    }

    debug!("Worker loop exited");
}
