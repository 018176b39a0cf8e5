//! Connection lifecycle hooks.
//!
//! The transport calls [`ConnectionWatcher::connected`] for every new
//! connection and [`ConnectionWatcher::disconnected`] once it has removed
//! a closed one.

use std::sync::Arc;

use super::IdService;
use crate::peer_store::AddrTtl;
use crate::transport::{Connectedness, Connection};

#[derive(Clone)]
pub struct ConnectionWatcher {
    service: IdService,
}

impl ConnectionWatcher {
    pub(super) fn new(service: IdService) -> Self {
        Self { service }
    }

    /// Start identifying a new connection. Does not wait for the result.
    pub fn connected(&self, conn: Arc<dyn Connection>) {
        let _ = self.service.identify_wait(conn);
    }

    /// Drop the connection's ticket. If it was the last connection to the
    /// peer, the peer's addresses move to the recently-connected TTL.
    pub async fn disconnected(&self, conn: &dyn Connection) {
        let inner = &self.service.inner;
        self.service.remove_conn(conn.id());

        let peer = conn.remote_peer();
        let _guard = inner.addr_mu.lock().await;
        if inner.network.connectedness(&peer) != Connectedness::Connected {
            inner
                .store
                .update_addrs(&peer, AddrTtl::Connected, AddrTtl::RecentlyConnected);
            tracing::debug!(peer = %peer.short(), "last connection closed; addresses kept as recently connected");
        }
    }
}
