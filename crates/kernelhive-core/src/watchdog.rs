//! Inactivity watchdog.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kernelhive_protocols::KernelState;

use crate::registry::KernelInstance;

/// Destroys kernels on the watchdog's behalf.
#[async_trait]
pub trait Reaper: Send + Sync {
    async fn reap(&self, kernel_id: &str);
}

/// Watch one kernel and reap it after `timeout` without activity.
///
/// Activity is creation or the end of an execution. A busy kernel is never
/// reaped. The task holds only weak references and stops when the kernel's
/// watchdog token is cancelled.
pub fn spawn_inactivity_watchdog(
    reaper: Weak<dyn Reaper>,
    kernel: Weak<KernelInstance>,
    timeout: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let wait = {
                let Some(instance) = kernel.upgrade() else {
                    return;
                };
                match instance.state() {
                    KernelState::Destroyed => return,
                    KernelState::Busy => timeout,
                    KernelState::Idle => {
                        let idle_for = instance.idle_for();
                        if idle_for >= timeout {
                            let id = instance.id.clone();
                            drop(instance);
                            if let Some(reaper) = reaper.upgrade() {
                                info!(kernel_id = %id, timeout_secs = timeout.as_secs_f64(), "Reaping inactive kernel");
                                reaper.reap(&id).await;
                            }
                            return;
                        }
                        timeout - idle_for
                    }
                }
            };

            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Inactivity watchdog stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    });
}
