//! The identify engine.
//!
//! One [`IdService`] per host. It answers identify requests, runs exactly
//! one identify exchange per connection, applies what peers tell us to the
//! peer store, and pushes our own changes to connected peers.
//!
//! Submodules split the work by role:
//!
//! | module        | role                                                   |
//! |---------------|--------------------------------------------------------|
//! | `coordinator` | per-connection tickets, the requester-side exchange    |
//! | `builder`     | building our payload, answering requests               |
//! | `consumer`    | applying received payloads, pushes and deltas          |
//! | `broadcast`   | deadline-bound fan-out to connected peers              |
//! | `watcher`     | connect/disconnect notifications from the transport    |

mod broadcast;
mod builder;
mod consumer;
mod coordinator;
mod watcher;

pub use broadcast::PayloadWriter;
pub use coordinator::IdentifySignal;
pub use watcher::ConnectionWatcher;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use ident_core::config::IdentifyConfig;
use ident_core::{wire, PeerAddr, PublicKey};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, IdentifyEvent};
use crate::observed::ObservedAddrs;
use crate::peer_store::PeerStore;
use crate::transport::{BoxStream, ConnId, Network, StreamHandler};

/// Why an identify exchange did not complete.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentifyError {
    #[error("failed to open identify stream: {0}")]
    StreamOpen(String),

    #[error("identify protocol negotiation failed: {0}")]
    Negotiation(String),

    #[error("failed to read identify message: {0}")]
    Read(String),

    #[error("identify exchange abandoned")]
    Abandoned,
}

/// Handle to the identify engine. Cheap to clone.
#[derive(Clone)]
pub struct IdService {
    inner: Arc<Inner>,
}

struct Inner {
    network: Arc<dyn Network>,
    store: Arc<dyn PeerStore>,
    observed: Arc<dyn ObservedAddrs>,
    bus: EventBus,
    /// `None` on unauthenticated transports.
    local_key: Option<PublicKey>,
    settings: IdentifyConfig,

    /// Connection -> ticket. Read-mostly; see `coordinator`.
    conns: RwLock<HashMap<ConnId, IdentifySignal>>,

    /// Serializes multi-step address TTL transitions.
    addr_mu: tokio::sync::Mutex<()>,

    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl IdService {
    /// Build the engine and start its protocol-change listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        network: Arc<dyn Network>,
        store: Arc<dyn PeerStore>,
        observed: Arc<dyn ObservedAddrs>,
        bus: EventBus,
        local_key: Option<PublicKey>,
        settings: IdentifyConfig,
    ) -> Self {
        let service = Self {
            inner: Arc::new(Inner {
                network,
                store,
                observed,
                bus,
                local_key,
                settings,
                conns: RwLock::new(HashMap::new()),
                addr_mu: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                listener: Mutex::new(None),
            }),
        };

        let handle = tokio::spawn(protocol_change_loop(
            Arc::downgrade(&service.inner),
            service.inner.bus.subscribe(),
            service.inner.shutdown.clone(),
        ));
        *service
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        service
    }

    /// Stop the engine. Waits for the protocol-change listener to exit.
    /// In-flight exchanges are not aborted. Safe to call more than once.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "protocol change listener ended abnormally");
            }
            tracing::debug!("identify service closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn watcher(&self) -> ConnectionWatcher {
        ConnectionWatcher::new(self.clone())
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Our vetted observed addresses.
    pub fn own_observed_addrs(&self) -> Vec<PeerAddr> {
        self.inner.observed.addrs()
    }

    /// Vetted observed addresses seen through our local address `local`.
    pub fn observed_addrs_for(&self, local: &PeerAddr) -> Vec<PeerAddr> {
        self.inner.observed.addrs_for(local)
    }

    /// Dispatch an inbound stream by its negotiated protocol.
    pub async fn handle_stream(&self, mut stream: BoxStream) {
        let protocol = stream.protocol().map(str::to_owned);
        match protocol.as_deref() {
            Some(wire::ID) => self.handle_request(stream).await,
            Some(wire::ID_PUSH) => self.handle_push(stream).await,
            Some(wire::ID_DELTA) => self.handle_delta(stream).await,
            other => {
                tracing::debug!(protocol = ?other, "stream for unknown protocol");
                stream.reset();
            }
        }
    }
}

#[async_trait]
impl StreamHandler for IdService {
    async fn handle(&self, stream: BoxStream) {
        self.handle_stream(stream).await;
    }
}

/// Turns local protocol changes into delta pushes until shutdown.
async fn protocol_change_loop(
    inner: std::sync::Weak<Inner>,
    mut events: tokio::sync::broadcast::Receiver<IdentifyEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(IdentifyEvent::LocalProtocolsUpdated { added, removed }) => {
                    let Some(inner) = inner.upgrade() else { break };
                    IdService { inner }.fire_protocol_delta(added, removed);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "protocol change listener lagged; some deltas were not pushed");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::trace!("protocol change listener stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{eventually, TestNode};

    #[tokio::test]
    async fn close_is_idempotent_and_stops_delta_pushes() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        a.connect_and_identify(&b).await.unwrap();

        a.service.close().await;
        a.service.close().await;
        assert!(a.service.is_closed());

        a.bus.emit(IdentifyEvent::LocalProtocolsUpdated {
            added: vec!["/chat/1".to_string()],
            removed: Vec::new(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.host.opened_count(&b.peer_id(), wire::ID_DELTA), 0);
    }

    #[tokio::test]
    async fn unknown_protocol_stream_is_reset() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        a.add_protocols(&["/other/1"]);
        a.connect_and_identify(&b).await.unwrap();
        let before = a.host.reset_count();

        let _stream = b.host.new_stream(&a.peer_id(), "/other/1").await.unwrap();
        assert!(eventually(|| a.host.reset_count() == before + 1).await);
    }

    #[tokio::test]
    async fn identify_after_close_still_runs() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        a.service.close().await;
        a.connect_and_identify(&b).await.unwrap();
        assert_eq!(a.service.ticket_count(), 1);
    }
}
