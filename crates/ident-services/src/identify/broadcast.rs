//! Fan-out to every connected peer.
//!
//! One task per peer, all sharing a single deadline. Each task waits for the
//! peer to be identified, skips peers that do not speak the target protocol,
//! then opens a stream and writes one payload. A send still running at the
//! deadline is reset. A supervisor joins the per-peer tasks and then cancels
//! the broadcast's token.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use ident_core::wire::{self, DeltaMessage, WireError};
use ident_core::PeerId;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::IdService;
use crate::transport::BoxStream;

/// Writes one broadcast payload to a freshly opened stream.
#[async_trait]
pub trait PayloadWriter: Send + Sync {
    async fn write(&self, stream: &mut BoxStream) -> Result<(), WireError>;
}

/// Full identify payload for the push protocol.
struct IdentifyWriter {
    service: IdService,
}

#[async_trait]
impl PayloadWriter for IdentifyWriter {
    async fn write(&self, stream: &mut BoxStream) -> Result<(), WireError> {
        self.service.write_identify(stream).await
    }
}

struct DeltaWriter {
    delta: DeltaMessage,
    max_size: usize,
}

#[async_trait]
impl PayloadWriter for DeltaWriter {
    async fn write(&self, stream: &mut BoxStream) -> Result<(), WireError> {
        wire::write_message(stream, &self.delta, self.max_size).await
    }
}

/// Resolves once the deadline passes or the broadcast is cancelled.
async fn expired(deadline: Instant, token: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => {}
        _ = token.cancelled() => {}
    }
}

impl IdService {
    /// Push our full identify payload to every connected peer.
    pub fn push(&self) -> JoinHandle<()> {
        let writer = IdentifyWriter {
            service: self.clone(),
        };
        self.broadcast(wire::ID_PUSH, Arc::new(writer))
    }

    /// Push a protocol-list change to every connected peer.
    pub fn fire_protocol_delta(&self, added: Vec<String>, removed: Vec<String>) -> Option<JoinHandle<()>> {
        let delta = DeltaMessage {
            added_protocols: added,
            rm_protocols: removed,
        };
        if delta.is_empty() {
            return None;
        }
        let writer = DeltaWriter {
            delta,
            max_size: self.inner.settings.max_message_size,
        };
        Some(self.broadcast(wire::ID_DELTA, Arc::new(writer)))
    }

    /// Send `writer`'s payload on `protocol` to every connected peer that
    /// supports it. The handle resolves when every peer is done or reset.
    pub fn broadcast(&self, protocol: &'static str, writer: Arc<dyn PayloadWriter>) -> JoinHandle<()> {
        let token = self.inner.shutdown.child_token();
        let deadline = Instant::now() + self.inner.settings.push_timeout();
        let peers = self.inner.network.peers();
        tracing::debug!(protocol, peers = peers.len(), "broadcast starting");

        let tasks: Vec<_> = peers
            .into_iter()
            .map(|peer| {
                let service = self.clone();
                let writer = writer.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    service
                        .broadcast_to(peer, protocol, writer, deadline, token)
                        .await
                })
            })
            .collect();

        tokio::spawn(async move {
            join_all(tasks).await;
            token.cancel();
            tracing::trace!(protocol, "broadcast finished");
        })
    }

    async fn broadcast_to(
        &self,
        peer: PeerId,
        protocol: &'static str,
        writer: Arc<dyn PayloadWriter>,
        deadline: Instant,
        token: CancellationToken,
    ) {
        let network = &self.inner.network;

        for conn in network.conns_to_peer(&peer) {
            let signal = self.identify_wait(conn);
            tokio::select! {
                _ = signal.wait() => {}
                _ = expired(deadline, &token) => {
                    tracing::debug!(peer = %peer.short(), protocol, "deadline passed waiting for identify");
                    return;
                }
            }
        }

        match self.inner.store.supports_protocols(&peer, &[protocol]) {
            Ok(supported) if supported.is_empty() => {
                tracing::trace!(peer = %peer.short(), protocol, "peer does not support protocol");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(peer = %peer.short(), error = %e, "protocol lookup failed; sending anyway");
            }
        }

        let mut stream = tokio::select! {
            opened = network.new_stream(&peer, protocol) => match opened {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(peer = %peer.short(), protocol, error = %e, "failed to open broadcast stream");
                    return;
                }
            },
            _ = expired(deadline, &token) => return,
        };

        let sent = tokio::select! {
            res = writer.write(&mut stream) => Some(res),
            _ = expired(deadline, &token) => None,
        };
        match sent {
            Some(Ok(())) => {
                let _ = stream.shutdown().await;
                tracing::trace!(peer = %peer.short(), protocol, "broadcast sent");
            }
            Some(Err(e)) => {
                tracing::debug!(peer = %peer.short(), protocol, error = %e, "broadcast send failed");
                stream.reset();
            }
            None => {
                tracing::debug!(peer = %peer.short(), protocol, "broadcast timed out; resetting stream");
                stream.reset();
            }
        }
    }
}
