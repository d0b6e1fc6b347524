//! Event multiplexing: engine callbacks to ordered stream events.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use futures::stream::FusedStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use kernelhive_protocols::{
    DisplayData, EngineFault, EventKind, ExecuteResult, MimeBundle, RawOutput, StreamEvent,
};

use crate::handle::panic_fault;

/// Opaque handle returned by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Listener = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Per-kernel subscriber lists keyed by event kind.
#[derive(Default)]
pub struct EventListeners {
    next_id: AtomicU64,
    by_kind: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_kind
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut by_kind = self.by_kind.lock();
        for listeners in by_kind.values_mut() {
            if let Some(pos) = listeners.iter().position(|(lid, _)| *lid == id) {
                listeners.remove(pos);
                return true;
            }
        }
        false
    }

    /// Invoke listeners for the event's kind in subscription order.
    ///
    /// The list is snapshotted first, so a listener may subscribe or
    /// unsubscribe from inside its callback. A panicking listener is logged
    /// and skipped; the rest still run.
    pub fn dispatch(&self, event: &StreamEvent) {
        let snapshot: Vec<(ListenerId, Listener)> = match self.by_kind.lock().get(&event.kind()) {
            Some(listeners) => listeners.clone(),
            None => return,
        };
        for (id, listener) in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                let fault = panic_fault("ListenerPanic", payload);
                warn!(listener = %id, kind = ?event.kind(), error = %fault.evalue, "Event listener panicked");
            }
        }
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.by_kind.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.by_kind.lock().clear();
    }
}

/// Normalizes one kernel's engine output into [`StreamEvent`]s.
pub struct EventMultiplexer {
    listeners: EventListeners,
    execution_count: AtomicU64,
}

impl EventMultiplexer {
    pub fn new() -> Self {
        Self {
            listeners: EventListeners::new(),
            execution_count: AtomicU64::new(0),
        }
    }

    pub fn listeners(&self) -> &EventListeners {
        &self.listeners
    }

    /// Number the next execution.
    pub fn begin_execution(&self) -> u64 {
        self.execution_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::SeqCst)
    }

    pub fn normalize_output(output: RawOutput) -> StreamEvent {
        match output {
            RawOutput::Stdout(text) => StreamEvent::stdout(text),
            RawOutput::Stderr(text) => StreamEvent::stderr(text),
            RawOutput::Display {
                data,
                metadata,
                display_id,
            } => StreamEvent::DisplayData(DisplayData {
                data,
                metadata,
                display_id,
            }),
            RawOutput::UpdateDisplay {
                data,
                metadata,
                display_id,
            } => StreamEvent::UpdateDisplayData(DisplayData {
                data,
                metadata,
                display_id: Some(display_id),
            }),
        }
    }

    /// The terminal event of an execution, if it has one. A statement-only
    /// execution that succeeds produces no terminal event.
    pub fn normalize_outcome(
        execution_count: u64,
        outcome: Result<Option<MimeBundle>, EngineFault>,
    ) -> Option<StreamEvent> {
        match outcome {
            Ok(Some(data)) => Some(StreamEvent::ExecuteResult(ExecuteResult {
                execution_count,
                data,
            })),
            Ok(None) => None,
            Err(fault) => Some(StreamEvent::ExecuteError(fault)),
        }
    }

    /// Notify listeners, then hand the event to the stream consumer.
    ///
    /// Waits while the consumer's buffer is full. A dropped consumer does not
    /// stop listener delivery.
    pub async fn publish(&self, event: StreamEvent, stream: &mpsc::Sender<StreamEvent>) {
        self.listeners.dispatch(&event);
        let _ = stream.send(event).await;
    }
}

impl Default for EventMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Events buffered between an execution and its stream consumer.
pub const STREAM_BUFFER: usize = 64;

/// The lazy, finite event sequence of one execution.
///
/// Once it has ended, polling again yields `None`.
pub struct ExecutionStream {
    kernel_id: String,
    request_id: String,
    receiver: mpsc::Receiver<StreamEvent>,
    done: bool,
}

impl ExecutionStream {
    pub(crate) fn new(
        kernel_id: impl Into<String>,
        request_id: impl Into<String>,
        receiver: mpsc::Receiver<StreamEvent>,
    ) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            request_id: request_id.into(),
            receiver,
            done: false,
        }
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Stream for ExecutionStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.receiver).poll_recv(cx) {
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl FusedStream for ExecutionStream {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
