//! Observed-address tracking — how remote peers see us.
//!
//! Every incoming identify payload may tell us the address the sender saw
//! our side of the connection come from. A single report proves nothing, so
//! an observation only becomes one of our vetted addresses once enough
//! distinct observers have reported it recently.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ident_core::PeerAddr;
use tokio::time::Instant;

use crate::transport::Connection;

/// Distinct observers needed before an observation is trusted.
pub const ACTIVATION_THRESHOLD: usize = 4;

/// How long one observer's report counts.
pub const OBSERVATION_TTL: Duration = Duration::from_secs(30 * 60);

/// Sink for observed-address samples and source of our vetted addresses.
pub trait ObservedAddrs: Send + Sync {
    /// Record that `conn`'s remote end saw us as `observed`.
    fn record(&self, conn: &dyn Connection, observed: PeerAddr);

    /// All vetted observations of ourselves.
    fn addrs(&self) -> Vec<PeerAddr>;

    /// Vetted observations made through our local address `local`.
    fn addrs_for(&self, local: &PeerAddr) -> Vec<PeerAddr>;
}

/// DashMap-backed [`ObservedAddrs`].
#[derive(Clone)]
pub struct ObservedAddrManager {
    // (local addr, observed addr) -> observer ip -> last report
    #[allow(clippy::type_complexity)]
    observations: Arc<DashMap<(PeerAddr, PeerAddr), HashMap<IpAddr, Instant>>>,
}

impl Default for ObservedAddrManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservedAddrManager {
    pub fn new() -> Self {
        Self {
            observations: Arc::new(DashMap::new()),
        }
    }

    /// Distinct (local, observed) pairs currently tracked.
    pub fn tracked(&self) -> usize {
        self.observations.len()
    }

    /// Drop reports older than [`OBSERVATION_TTL`] and forget empty entries.
    pub fn prune(&self) {
        let now = Instant::now();
        self.observations.retain(|_, observers| {
            observers.retain(|_, seen| now.duration_since(*seen) < OBSERVATION_TTL);
            !observers.is_empty()
        });
    }

    fn vetted(&self, local: Option<&PeerAddr>) -> Vec<PeerAddr> {
        let now = Instant::now();
        let mut out: Vec<PeerAddr> = Vec::new();
        for entry in self.observations.iter() {
            let (entry_local, observed) = entry.key();
            if local.is_some_and(|l| l != entry_local) {
                continue;
            }
            let fresh = entry
                .value()
                .values()
                .filter(|seen| now.duration_since(**seen) < OBSERVATION_TTL)
                .count();
            if fresh >= ACTIVATION_THRESHOLD && !out.contains(observed) {
                out.push(*observed);
            }
        }
        out.sort();
        out
    }
}

impl ObservedAddrs for ObservedAddrManager {
    fn record(&self, conn: &dyn Connection, observed: PeerAddr) {
        let observer = conn.remote_addr().socket_addr().ip();
        self.observations
            .entry((conn.local_addr(), observed))
            .or_default()
            .insert(observer, Instant::now());
        tracing::trace!(observed = %observed, observer = %observer, "observation recorded");
    }

    fn addrs(&self) -> Vec<PeerAddr> {
        self.vetted(None)
    }

    fn addrs_for(&self, local: &PeerAddr) -> Vec<PeerAddr> {
        self.vetted(Some(local))
    }
}
