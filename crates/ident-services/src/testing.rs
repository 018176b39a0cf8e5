//! In-memory transport and test nodes.
//!
//! `MemoryHost` implements [`Network`] without sockets: a connection is a
//! pair of twin `MemoryConn`s, one registered on each host, and a stream is
//! a `tokio::io::duplex` pipe whose far end is handed to the remote host's
//! stream handler once a protocol is negotiated. Hosts record every
//! negotiation attempt and every reset so tests can assert on them.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ident_core::config::IdentifyConfig;
use ident_core::{wire, Keypair, PeerAddr, PeerId};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::broadcast;

use crate::events::{EventBus, IdentifyEvent};
use crate::identify::{ConnectionWatcher, IdService, IdentifyError};
use crate::observed::ObservedAddrManager;
use crate::peer_store::MemoryPeerStore;
use crate::transport::{
    BoxStream, ConnId, Connection, Network, Stream, StreamHandler, TransportError,
};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

const STREAM_BUFFER: usize = 64 * 1024;

// ── Host ──────────────────────────────────────────────────────────────────────

pub struct MemoryHost {
    keypair: Keypair,
    listen_addrs: RwLock<Vec<PeerAddr>>,
    protocols: RwLock<Vec<String>>,
    conns: DashMap<ConnId, Arc<MemoryConn>>,
    handler: RwLock<Option<Arc<dyn StreamHandler>>>,
    watcher: RwLock<Option<ConnectionWatcher>>,
    /// (remote peer, protocol) for every negotiation we started.
    opened: Mutex<Vec<(PeerId, String)>>,
    resets: AtomicUsize,
    fail_stream_open: AtomicBool,
}

impl MemoryHost {
    pub fn new(listen_addrs: Vec<PeerAddr>) -> Arc<Self> {
        Arc::new(Self {
            keypair: Keypair::generate(),
            listen_addrs: RwLock::new(listen_addrs),
            protocols: RwLock::new(Vec::new()),
            conns: DashMap::new(),
            handler: RwLock::new(None),
            watcher: RwLock::new(None),
            opened: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            fail_stream_open: AtomicBool::new(false),
        })
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn set_protocols(&self, protocols: Vec<String>) {
        *self.protocols.write().unwrap_or_else(PoisonError::into_inner) = protocols;
    }

    pub fn set_listen_addrs(&self, addrs: Vec<PeerAddr>) {
        *self.listen_addrs.write().unwrap_or_else(PoisonError::into_inner) = addrs;
    }

    pub fn set_handler(&self, handler: Arc<dyn StreamHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn set_watcher(&self, watcher: ConnectionWatcher) {
        *self.watcher.write().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
    }

    /// Make every `Connection::new_stream` on this host fail.
    pub fn set_fail_stream_open(&self, fail: bool) {
        self.fail_stream_open.store(fail, Ordering::SeqCst);
    }

    /// Negotiations this host started towards `peer` for `protocol`.
    pub fn opened_count(&self, peer: &PeerId, protocol: &str) -> usize {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(p, proto)| p == peer && proto == protocol)
            .count()
    }

    /// Streams reset on this side.
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Connect to `remote`. Returns our side and theirs.
    pub fn connect(self: &Arc<Self>, remote: &Arc<MemoryHost>) -> (Arc<MemoryConn>, Arc<MemoryConn>) {
        self.link(remote, false)
    }

    /// Connect to `remote` without learning its peer id, as over a
    /// transport that does not authenticate.
    pub fn connect_unauthenticated(
        self: &Arc<Self>,
        remote: &Arc<MemoryHost>,
    ) -> (Arc<MemoryConn>, Arc<MemoryConn>) {
        self.link(remote, true)
    }

    fn link(
        self: &Arc<Self>,
        remote: &Arc<MemoryHost>,
        hide_remote: bool,
    ) -> (Arc<MemoryConn>, Arc<MemoryConn>) {
        let ours = MemoryConn::new(
            self,
            remote,
            if hide_remote { PeerId::EMPTY } else { remote.peer_id() },
        );
        let theirs = MemoryConn::new(remote, self, self.peer_id());
        let _ = ours.twin.set(Arc::downgrade(&theirs));
        let _ = theirs.twin.set(Arc::downgrade(&ours));

        self.conns.insert(ours.id, ours.clone());
        remote.conns.insert(theirs.id, theirs.clone());
        self.notify_connected(ours.clone());
        remote.notify_connected(theirs.clone());
        (ours, theirs)
    }

    fn primary_addr(&self) -> PeerAddr {
        self.listen_addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .copied()
            .unwrap_or_else(|| PeerAddr::new(([0, 0, 0, 0], 0).into()))
    }

    fn current_watcher(&self) -> Option<ConnectionWatcher> {
        self.watcher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify_connected(&self, conn: Arc<MemoryConn>) {
        if let Some(watcher) = self.current_watcher() {
            watcher.connected(conn);
        }
    }

    async fn notify_disconnected(&self, conn: &MemoryConn) {
        let watcher = self.current_watcher();
        if let Some(watcher) = watcher {
            watcher.disconnected(conn).await;
        }
    }
}

#[async_trait]
impl Network for MemoryHost {
    fn local_peer(&self) -> PeerId {
        self.peer_id()
    }

    fn listen_addrs(&self) -> Vec<PeerAddr> {
        self.listen_addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn protocols(&self) -> Vec<String> {
        self.protocols
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = Vec::new();
        for conn in self.conns.iter() {
            if !peers.contains(&conn.remote_peer) {
                peers.push(conn.remote_peer);
            }
        }
        peers
    }

    fn conns_to_peer(&self, peer: &PeerId) -> Vec<Arc<dyn Connection>> {
        self.conns
            .iter()
            .filter(|c| c.remote_peer == *peer)
            .map(|c| c.value().clone() as Arc<dyn Connection>)
            .collect()
    }

    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxStream, TransportError> {
        let conn = self
            .conns_to_peer(peer)
            .into_iter()
            .next()
            .ok_or(TransportError::NotConnected(*peer))?;
        let mut stream = conn.new_stream().await?;
        if let Err(e) = stream.select_protocol(protocol).await {
            stream.reset();
            return Err(e);
        }
        Ok(stream)
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

pub struct MemoryConn {
    id: ConnId,
    me: Weak<MemoryConn>,
    twin: OnceLock<Weak<MemoryConn>>,
    local_host: Weak<MemoryHost>,
    remote_host: Weak<MemoryHost>,
    local_peer: PeerId,
    remote_peer: PeerId,
    local_addr: PeerAddr,
    remote_addr: PeerAddr,
    closed: AtomicBool,
}

impl MemoryConn {
    fn new(local: &Arc<MemoryHost>, remote: &Arc<MemoryHost>, remote_peer: PeerId) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            twin: OnceLock::new(),
            local_host: Arc::downgrade(local),
            remote_host: Arc::downgrade(remote),
            local_peer: local.peer_id(),
            remote_peer,
            local_addr: local.primary_addr(),
            remote_addr: remote.primary_addr(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn twin(&self) -> Option<Arc<MemoryConn>> {
        self.twin.get().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl Connection for MemoryConn {
    fn id(&self) -> ConnId {
        self.id
    }

    fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    fn local_addr(&self) -> PeerAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> PeerAddr {
        self.remote_addr
    }

    async fn new_stream(&self) -> Result<BoxStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let host = self.local_host.upgrade().ok_or(TransportError::Closed)?;
        if host.fail_stream_open.load(Ordering::SeqCst) {
            return Err(TransportError::StreamOpen("stream open disabled".into()));
        }
        let conn = self.me.upgrade().ok_or(TransportError::Closed)?;
        let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);
        Ok(Box::new(MemoryStream {
            conn,
            io: Some(ours),
            peer_io: Some(theirs),
            protocol: None,
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let twin = self.twin();
        if let Some(twin) = &twin {
            twin.closed.store(true, Ordering::SeqCst);
        }

        // Unregister both sides before anyone is told, so connectedness is
        // already accurate inside the callbacks.
        let local = self.local_host.upgrade();
        let remote = self.remote_host.upgrade();
        if let Some(host) = &local {
            host.conns.remove(&self.id);
        }
        if let (Some(host), Some(twin)) = (&remote, &twin) {
            host.conns.remove(&twin.id);
        }

        if let Some(host) = &local {
            host.notify_disconnected(self).await;
        }
        if let (Some(host), Some(twin)) = (&remote, &twin) {
            host.notify_disconnected(twin).await;
        }
    }
}

// ── Stream ────────────────────────────────────────────────────────────────────

pub struct MemoryStream {
    conn: Arc<MemoryConn>,
    io: Option<DuplexStream>,
    /// Far end of the pipe until a protocol is negotiated.
    peer_io: Option<DuplexStream>,
    protocol: Option<String>,
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
}

#[async_trait]
impl Stream for MemoryStream {
    fn conn(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }

    fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    async fn select_protocol(&mut self, protocol: &str) -> Result<(), TransportError> {
        let local = self.conn.local_host.upgrade().ok_or(TransportError::Closed)?;
        let remote = self.conn.remote_host.upgrade().ok_or(TransportError::Closed)?;
        local
            .opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((remote.peer_id(), protocol.to_string()));

        if !remote.protocols().iter().any(|p| p == protocol) {
            return Err(TransportError::ProtocolUnsupported(protocol.to_string()));
        }
        let twin = self.conn.twin().ok_or(TransportError::Closed)?;
        let peer_io = self
            .peer_io
            .take()
            .ok_or_else(|| TransportError::Negotiation("stream already negotiated".into()))?;
        self.protocol = Some(protocol.to_string());

        let inbound = MemoryStream {
            conn: twin,
            io: Some(peer_io),
            peer_io: None,
            protocol: Some(protocol.to_string()),
        };
        let handler = remote
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            tokio::spawn(async move { handler.handle(Box::new(inbound)).await });
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.io = None;
        self.peer_io = None;
        if let Some(host) = self.conn.local_host.upgrade() {
            host.resets.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_read(cx, buf),
            None => Poll::Ready(Err(reset_error())),
        }
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_write(cx, buf),
            None => Poll::Ready(Err(reset_error())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Err(reset_error())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

// ── Test node ─────────────────────────────────────────────────────────────────

/// A host with a running identify service attached.
pub struct TestNode {
    pub host: Arc<MemoryHost>,
    pub store: MemoryPeerStore,
    pub observed: ObservedAddrManager,
    pub bus: EventBus,
    pub service: IdService,
}

impl TestNode {
    pub fn new(listen: &[&str]) -> Self {
        Self::build(listen, true, IdentifyConfig::default())
    }

    /// A node that announces no public key.
    pub fn without_key(listen: &[&str]) -> Self {
        Self::build(listen, false, IdentifyConfig::default())
    }

    pub fn with_settings(listen: &[&str], settings: IdentifyConfig) -> Self {
        Self::build(listen, true, settings)
    }

    fn build(listen: &[&str], announce_key: bool, settings: IdentifyConfig) -> Self {
        let addrs = listen.iter().filter_map(|a| a.parse().ok()).collect();
        let host = MemoryHost::new(addrs);
        host.set_protocols(vec![
            wire::ID.to_string(),
            wire::ID_PUSH.to_string(),
            wire::ID_DELTA.to_string(),
        ]);

        let store = MemoryPeerStore::new();
        let observed = ObservedAddrManager::new();
        let bus = EventBus::new(settings.event_buffer);
        let local_key = announce_key.then(|| host.keypair().public);
        let service = IdService::new(
            host.clone(),
            Arc::new(store.clone()),
            Arc::new(observed.clone()),
            bus.clone(),
            local_key,
            settings,
        );
        host.set_handler(Arc::new(service.clone()));
        host.set_watcher(service.watcher());

        Self {
            host,
            store,
            observed,
            bus,
            service,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.peer_id()
    }

    /// Add protocols on top of the identify ones.
    pub fn add_protocols(&self, extra: &[&str]) {
        let mut protocols = self.host.protocols();
        for p in extra {
            if !protocols.iter().any(|have| have == p) {
                protocols.push(p.to_string());
            }
        }
        self.host.set_protocols(protocols);
    }

    /// Connect to `other`. Both sides start identifying on their own.
    pub fn connect(&self, other: &TestNode) -> (Arc<MemoryConn>, Arc<MemoryConn>) {
        self.host.connect(&other.host)
    }

    /// Connect and wait until both sides have identified each other.
    pub async fn connect_and_identify(
        &self,
        other: &TestNode,
    ) -> Result<(Arc<MemoryConn>, Arc<MemoryConn>), IdentifyError> {
        let (ours, theirs) = self.connect(other);
        self.service.identify_conn(ours.clone()).await?;
        other.service.identify_conn(theirs.clone()).await?;
        Ok((ours, theirs))
    }
}

// ── Waiting helpers ───────────────────────────────────────────────────────────

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Next event matching `pred`, or `None` after two seconds.
pub async fn next_event(
    rx: &mut broadcast::Receiver<IdentifyEvent>,
    mut pred: impl FnMut(&IdentifyEvent) -> bool,
) -> Option<IdentifyEvent> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .ok()
        .flatten()
}
