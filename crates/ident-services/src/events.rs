//! Process-wide event bus.
//!
//! Multi-producer, multi-consumer over `tokio::sync::broadcast`. A slow
//! subscriber lags and loses the oldest events rather than blocking
//! producers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ident_core::PeerId;
use tokio::sync::broadcast;

use crate::identify::IdentifyError;

#[derive(Debug, Clone)]
pub enum IdentifyEvent {
    /// A remote peer's protocol list changed.
    PeerProtocolsUpdated {
        peer: PeerId,
        added: Vec<String>,
        removed: Vec<String>,
    },
    /// An identify exchange with `peer` finished successfully.
    PeerIdentificationCompleted { peer: PeerId },
    /// An identify exchange with `peer` failed.
    PeerIdentificationFailed { peer: PeerId, reason: IdentifyError },
    /// Our own protocol list changed.
    LocalProtocolsUpdated {
        added: Vec<String>,
        removed: Vec<String>,
    },
}

impl IdentifyEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            IdentifyEvent::PeerProtocolsUpdated { .. } => "peer_protocols_updated",
            IdentifyEvent::PeerIdentificationCompleted { .. } => "identification_completed",
            IdentifyEvent::PeerIdentificationFailed { .. } => "identification_failed",
            IdentifyEvent::LocalProtocolsUpdated { .. } => "local_protocols_updated",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IdentifyEvent>,
    emitted: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Returns how many subscribers received it; zero
    /// subscribers is not an error.
    pub fn emit(&self, event: IdentifyEvent) -> usize {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(n) => {
                tracing::trace!(kind, receivers = n, "event emitted");
                n
            }
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IdentifyEvent> {
        self.sender.subscribe()
    }

    pub fn events_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}
