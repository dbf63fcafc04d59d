//! Typed control-plane event bus.
//!
//! Events carry structured payloads and are fanned out over broadcast
//! channels. Publishing never blocks the control loop; slow subscribers
//! lose oldest events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::worker::ContainerStatus;

/// Published when a stopped or lost worker is reaped from the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStoppedEvent {
    pub function_name: String,
    pub is_inspector: bool,
    pub worker_name: String,
    pub credential: String,
    pub pid: Option<i32>,
    /// Status the worker was reaped in (Stopped or Unknown).
    pub status: ContainerStatus,
}

const CHANNEL_CAPACITY: usize = 256;

/// Publish/subscribe hub for control-plane events.
#[derive(Clone)]
pub struct EventBus {
    worker_stopped: broadcast::Sender<WorkerStoppedEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (worker_stopped, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { worker_stopped }
    }

    pub fn subscribe_worker_stopped(&self) -> broadcast::Receiver<WorkerStoppedEvent> {
        self.worker_stopped.subscribe()
    }

    pub fn publish_worker_stopped(&self, event: WorkerStoppedEvent) {
        debug!(
            worker = %event.worker_name,
            function = %event.function_name,
            status = ?event.status,
            "worker stopped"
        );
        // No subscribers is fine; the event is telemetry, not a handshake.
        let _ = self.worker_stopped.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
