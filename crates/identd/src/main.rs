//! identd — peer identification daemon.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use ident_core::config::IdentConfig;
use ident_core::crypto::Keypair;
use ident_core::wire;

use ident_services::peer_store::{AGENT_VERSION_KEY, PROTOCOL_VERSION_KEY};
use ident_services::{
    EventBus, IdService, IdentifyEvent, MemoryPeerStore, Network, ObservedAddrManager, PeerStore,
    StreamHandler,
};

mod dispatch;
mod transport;


use dispatch::ProtocolRouter;
use transport::TcpHost;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = IdentConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = IdentConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        IdentConfig::default()
    });

    // Keypair
    let keypair = Keypair::load_or_generate(&config.identity.keypair_path)
        .context("failed to load keypair")?;
    let local_peer = keypair.peer_id();
    tracing::info!(peer = %local_peer, "keypair ready");

    // Shared state
    let store = MemoryPeerStore::new();
    store
        .add_pub_key(&local_peer, keypair.public)
        .context("failed to store own key")?;
    let observed = ObservedAddrManager::new();
    let bus = EventBus::new(config.identify.event_buffer);
    let router = Arc::new(ProtocolRouter::new(bus.clone()));

    // Transport
    let listen: SocketAddr = config
        .network
        .listen_addr
        .parse()
        .with_context(|| format!("bad listen address {}", config.network.listen_addr))?;
    let (host, listener) = TcpHost::bind(local_peer, listen, router.clone()).await?;
    tracing::info!(peer = %local_peer.short(), addr = %host.listen_addr(), "identd starting");

    // Identify service
    let local_key = if config.identity.announce_key {
        Some(keypair.public)
    } else {
        tracing::warn!("announce_key disabled; peers will not learn our public key");
        None
    };
    let service = IdService::new(
        host.clone(),
        Arc::new(store.clone()),
        Arc::new(observed.clone()),
        bus.clone(),
        local_key,
        config.identify.clone(),
    );
    attach(&host, &router, &service);

    // Shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("ctrl-c received");
            let _ = tx.send(());
        });
    }

    // ── Tasks ────────────────────────────────────────────────────────────────

    let transport_task = tokio::spawn(host.clone().run(listener, shutdown_tx.subscribe()));

    for peer in &config.network.bootstrap_peers {
        let addr: SocketAddr = match peer.parse() {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "skipping bad bootstrap address");
                continue;
            }
        };
        let host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = host.dial(addr).await {
                tracing::warn!(addr = %addr, error = %e, "bootstrap dial failed");
            }
        });
    }

    let event_logger = {
        let mut events = bus.subscribe();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    event = events.recv() => match event {
                        Ok(event) => log_event(&event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "event logger lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        })
    };

    let snapshot_printer = {
        let host = host.clone();
        let store = store.clone();
        let service = service.clone();
        let observed = observed.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                observed.prune();
                print_snapshot(&host, &store, &service);
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = transport_task      => tracing::error!("transport exited: {:?}", r),
        r = event_logger        => tracing::error!("event logger exited: {:?}", r),
        r = snapshot_printer    => tracing::error!("snapshot printer exited: {:?}", r),
    }

    service.close().await;
    host.close_all().await;
    tracing::info!(events = bus.events_emitted(), "identd stopped");
    Ok(())
}

/// Route the identify protocols to `service` and let it see every link.
fn attach(host: &TcpHost, router: &ProtocolRouter, service: &IdService) {
    host.set_watcher(service.watcher());
    let handler = Arc::new(service.clone()) as Arc<dyn StreamHandler>;
    for protocol in [wire::ID, wire::ID_PUSH, wire::ID_DELTA] {
        router.register(protocol, handler.clone());
    }
}

fn log_event(event: &IdentifyEvent) {
    match event {
        IdentifyEvent::PeerIdentificationCompleted { peer } => {
            tracing::info!(peer = %peer.short(), "peer identified");
        }
        IdentifyEvent::PeerIdentificationFailed { peer, reason } => {
            tracing::warn!(peer = %peer.short(), error = %reason, "peer identification failed");
        }
        IdentifyEvent::PeerProtocolsUpdated { peer, added, removed } => {
            tracing::info!(peer = %peer.short(), ?added, ?removed, "peer protocols updated");
        }
        IdentifyEvent::LocalProtocolsUpdated { added, removed } => {
            tracing::debug!(?added, ?removed, "local protocols updated");
        }
    }
}

fn print_snapshot(host: &TcpHost, store: &MemoryPeerStore, service: &IdService) {
    let peers = host.peers();
    tracing::info!(
        peers = peers.len(),
        tickets = service.ticket_count(),
        observed = ?service.own_observed_addrs(),
        "snapshot"
    );
    for peer in peers {
        tracing::info!(
            peer = %peer.short(),
            agent = %store.get(&peer, AGENT_VERSION_KEY).unwrap_or_default(),
            version = %store.get(&peer, PROTOCOL_VERSION_KEY).unwrap_or_default(),
            protocols = ?store.protocols(&peer),
            addrs = ?store.addrs(&peer),
            "  peer"
        );
    }
}
