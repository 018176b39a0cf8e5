//! ident integration tests.
//!
//! Multi-node scenarios over the in-memory transport from
//! `ident_services::testing`. Every node runs a full identify service; the
//! tests only drive connections and local changes and then check what the
//! other nodes learned.
//!
//!   cargo test --test integration

use ident_core::PeerAddr;
use ident_services::testing::TestNode;

mod addresses;
mod broadcast;
mod identify;
mod keys;
mod lifecycle;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Listen address of the `i`th node in a mesh.
pub fn node_addr(i: usize) -> String {
    format!("10.0.0.{}:4001", i + 1)
}

pub fn addr(s: &str) -> PeerAddr {
    s.parse().expect("test address")
}

/// `n` unconnected nodes at 10.0.0.1, 10.0.0.2, ...
pub fn nodes(n: usize) -> Vec<TestNode> {
    (0..n).map(|i| TestNode::new(&[node_addr(i).as_str()])).collect()
}

/// Connect every pair once and wait until both ends are identified.
pub async fn full_mesh(nodes: &[TestNode]) -> anyhow::Result<()> {
    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            a.connect_and_identify(b).await?;
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_harness_builds_distinct_nodes() {
    let mesh = nodes(3);
    assert_ne!(mesh[0].peer_id(), mesh[1].peer_id());
    assert_eq!(addr(&node_addr(2)), addr("10.0.0.3:4001"));
}
