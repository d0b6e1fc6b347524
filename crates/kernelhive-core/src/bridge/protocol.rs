//! Messages exchanged across the worker boundary.

use kernelhive_protocols::{EngineFault, EngineInfo, EngineInit, InterruptFlag, MimeBundle, RawOutput};

/// Host to worker.
#[derive(Debug)]
pub enum HostMessage {
    /// First message: build the engine. The flag is the only state shared
    /// with the host.
    Init {
        init: EngineInit,
        interrupt_buffer: Option<InterruptFlag>,
    },
    Execute {
        request_id: u64,
        code: String,
    },
    Shutdown,
}

/// Worker to host.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Handshake reply; the kernel is usable from here on.
    Ready(EngineInfo),
    InitFailed(String),
    Output {
        request_id: u64,
        output: RawOutput,
    },
    Completed {
        request_id: u64,
        result: Result<Option<MimeBundle>, EngineFault>,
    },
}

impl WorkerMessage {
    /// Request this message belongs to, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Output { request_id, .. } | Self::Completed { request_id, .. } => {
                Some(*request_id)
            }
            Self::Ready(_) | Self::InitFailed(_) => None,
        }
    }
}
