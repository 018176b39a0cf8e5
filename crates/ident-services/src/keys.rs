//! Key reconciliation — trust-on-first-use for announced public keys.
//!
//! A peer announces its public key in every identify payload. The first key
//! whose derived identity matches the connection's peer id is stored. After
//! that the stored key is never replaced: a different key is reported, not
//! adopted.
//!
//! Decision table, first match wins:
//!
//! | key bytes | parses | derived == remote | on file       | decision        |
//! |-----------|--------|-------------------|---------------|-----------------|
//! | absent    |        |                   |               | Absent          |
//! | present   | no     |                   |               | Unparseable     |
//! | present   | yes    | no, remote empty  |               | Adopt           |
//! | present   | yes    | no                |               | Mismatch        |
//! | present   | yes    | yes               | none          | TrustOnFirstUse |
//! | present   | yes    | yes               | same key      | Unchanged       |
//! | present   | yes    | yes               | different key | Conflict        |

use ident_core::{CryptoError, PeerId, PublicKey};

use crate::peer_store::PeerStore;
use crate::transport::Connection;

#[derive(Debug)]
pub enum KeyDecision {
    /// No key was sent. The transport is assumed unauthenticated.
    Absent,
    /// The key bytes did not parse.
    Unparseable(CryptoError),
    /// The connection carries no peer identity; use the derived one.
    Adopt { derived: PeerId, key: PublicKey },
    /// The key speaks for someone other than the connected peer.
    Mismatch { claimed: PeerId, derived: PeerId },
    /// First valid key for this peer.
    TrustOnFirstUse(PublicKey),
    /// Same key as the one on file.
    Unchanged,
    /// A different key derives the same identity as the connected peer while
    /// another key is already on file. Left unresolved.
    Conflict { on_file_matches: bool },
}

impl KeyDecision {
    /// Whether the decision stores a key.
    pub fn stores_key(&self) -> bool {
        matches!(
            self,
            KeyDecision::Adopt { .. } | KeyDecision::TrustOnFirstUse(_)
        )
    }
}

/// Classify an announced key. Pure; touches no state.
pub fn decide(
    remote: &PeerId,
    key_bytes: Option<&[u8]>,
    on_file: Option<&PublicKey>,
) -> KeyDecision {
    let Some(bytes) = key_bytes else {
        return KeyDecision::Absent;
    };
    let key = match PublicKey::from_bytes(bytes) {
        Ok(k) => k,
        Err(e) => return KeyDecision::Unparseable(e),
    };
    let derived = key.peer_id();

    if derived != *remote {
        if remote.is_empty() && !derived.is_empty() {
            return KeyDecision::Adopt { derived, key };
        }
        return KeyDecision::Mismatch {
            claimed: *remote,
            derived,
        };
    }

    match on_file {
        None => KeyDecision::TrustOnFirstUse(key),
        Some(current) if *current == key => KeyDecision::Unchanged,
        Some(current) => KeyDecision::Conflict {
            on_file_matches: current.peer_id() == *remote,
        },
    }
}

/// Apply the decision for `key_bytes` received on `conn` to `store`.
pub fn reconcile(
    store: &dyn PeerStore,
    conn: &dyn Connection,
    key_bytes: Option<&[u8]>,
) -> KeyDecision {
    let remote = conn.remote_peer();
    let on_file = store.pub_key(&remote);
    let decision = decide(&remote, key_bytes, on_file.as_ref());

    match &decision {
        KeyDecision::Absent => {
            tracing::debug!(peer = %remote.short(), "no public key announced");
        }
        KeyDecision::Unparseable(e) => {
            tracing::debug!(peer = %remote.short(), error = %e, "cannot parse announced public key");
        }
        KeyDecision::Adopt { derived, key } => {
            if let Err(e) = store.add_pub_key(derived, *key) {
                tracing::warn!(peer = %derived.short(), error = %e, "failed to store adopted key");
            } else {
                tracing::debug!(peer = %derived.short(), "adopted key for unidentified connection");
            }
        }
        KeyDecision::Mismatch { claimed, derived } => {
            tracing::error!(
                claimed = %claimed,
                derived = %derived,
                addr = %conn.remote_addr(),
                "announced key does not match connected peer"
            );
        }
        KeyDecision::TrustOnFirstUse(key) => {
            if let Err(e) = store.add_pub_key(&remote, *key) {
                tracing::warn!(peer = %remote.short(), error = %e, "failed to store public key");
            } else {
                tracing::debug!(peer = %remote.short(), "stored public key");
            }
        }
        KeyDecision::Unchanged => {}
        KeyDecision::Conflict { on_file_matches } => {
            if *on_file_matches {
                tracing::error!(
                    peer = %remote,
                    addr = %conn.remote_addr(),
                    "two different keys derive the same peer id; keeping the key on file"
                );
            } else {
                tracing::error!(
                    peer = %remote,
                    addr = %conn.remote_addr(),
                    "key on file does not derive its peer id; keeping it"
                );
            }
        }
    }
    decision
}
