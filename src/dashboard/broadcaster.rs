//! Fan-out of phase-transition events to connected dashboard clients.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::buffer::state_machine::BufferPhase;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct DashboardEvent {
    pub registry_key: String,
    pub conv_id_prefix: String,
    pub phase: BufferPhase,
    pub trigger: String,
    pub utilization: f64,
}

#[derive(Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<DashboardEvent>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.sender.subscribe()
    }

    /// Send an event to subscribers. Silently drops it if nobody is
    /// listening — the dashboard is observability, not a delivery channel.
    pub fn publish(&self, event: DashboardEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
