//! TCP transport.
//!
//! A logical connection is one long-lived *link* socket. Every stream is a
//! fresh socket to the peer's listen address. Both open with a preamble
//! written in the identify wire framing: the link preamble names the dialer
//! and the address it listens on, the stream preamble names the dialer and
//! the protocol it wants, and the acceptor answers a stream preamble with an
//! ack. Peer ids in preambles are claimed, not authenticated. Link EOF is a
//! disconnect.
//!
//! A connection's addresses are the link socket's own endpoints. The claimed
//! listen address is only used to open streams.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use ident_core::{wire, PeerAddr, PeerId};
use ident_services::{
    BoxStream, ConnId, Connection, ConnectionWatcher, Network, Stream, StreamHandler,
    TransportError,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::dispatch::ProtocolRouter;

const PREAMBLE_MAX: usize = 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Preamble {
    Link { peer: String, listen_addr: String },
    Stream { peer: String, protocol: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Ack {
    accepted: bool,
}

/// The address to open streams to for a peer that claimed `claimed` as its
/// listen address over a link from `from`.
fn reachable_addr(claimed: SocketAddr, from: SocketAddr) -> PeerAddr {
    if claimed.ip().is_unspecified() {
        PeerAddr::new(SocketAddr::new(from.ip(), claimed.port()))
    } else {
        PeerAddr::new(claimed)
    }
}

/// Addresses to announce for a socket bound to `bound`. An unspecified bind
/// address stands for every interface of the same family.
fn announce_addrs(bound: SocketAddr, interfaces: &[IpAddr]) -> Vec<PeerAddr> {
    if !bound.ip().is_unspecified() {
        return vec![PeerAddr::new(bound)];
    }
    let mut addrs: Vec<PeerAddr> = Vec::new();
    for ip in interfaces {
        if ip.is_ipv4() != bound.is_ipv4() || ip.is_unspecified() {
            continue;
        }
        let addr = PeerAddr::new(SocketAddr::new(*ip, bound.port()));
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    addrs
}

fn interface_ips() -> Vec<IpAddr> {
    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.iter().map(|i| i.ip()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to list network interfaces");
            Vec::new()
        }
    }
}

// ── Host ──────────────────────────────────────────────────────────────────────

pub struct TcpHost {
    peer_id: PeerId,
    listen_addr: PeerAddr,
    /// What we tell peers we listen on.
    announce: Vec<PeerAddr>,
    router: Arc<ProtocolRouter>,
    conns: DashMap<ConnId, Arc<TcpConn>>,
    watcher: OnceLock<ConnectionWatcher>,
}

impl TcpHost {
    /// Bind the listen socket. Accepting starts with [`TcpHost::run`].
    pub async fn bind(
        peer_id: PeerId,
        addr: SocketAddr,
        router: Arc<ProtocolRouter>,
    ) -> Result<(Arc<Self>, TcpListener)> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let bound = listener.local_addr()?;
        let interfaces = if bound.ip().is_unspecified() {
            interface_ips()
        } else {
            Vec::new()
        };
        let announce = announce_addrs(bound, &interfaces);
        if announce.is_empty() {
            tracing::warn!(addr = %bound, "no announceable listen addresses");
        }
        let host = Arc::new(Self {
            peer_id,
            listen_addr: PeerAddr::new(bound),
            announce,
            router,
            conns: DashMap::new(),
            watcher: OnceLock::new(),
        });
        Ok((host, listener))
    }

    pub fn listen_addr(&self) -> PeerAddr {
        self.listen_addr
    }

    /// Install the connection watcher. Only the first call has effect.
    pub fn set_watcher(&self, watcher: ConnectionWatcher) {
        if self.watcher.set(watcher).is_err() {
            tracing::warn!("connection watcher already set");
        }
    }

    /// Accept links and streams until shutdown, then close every connection.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        tracing::info!(addr = %self.listen_addr, "transport listening");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("transport shutting down");
                    self.close_all().await;
                    return Ok(());
                }

                accepted = listener.accept() => {
                    let (socket, from) = match accepted {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let host = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = host.accept(socket, from).await {
                            tracing::debug!(from = %from, error = %e, "inbound socket rejected");
                        }
                    });
                }
            }
        }
    }

    /// Open a link to `addr`.
    pub async fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<TcpConn>> {
        let mut socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        wire::write_message(&mut socket, &self.link_preamble(), PREAMBLE_MAX).await?;
        let reply = timeout(
            HANDSHAKE_TIMEOUT,
            wire::read_message::<_, Preamble>(&mut socket, PREAMBLE_MAX),
        )
        .await
        .context("link handshake timed out")??;

        let Preamble::Link { peer, .. } = reply else {
            anyhow::bail!("unexpected reply to link preamble");
        };
        let remote_peer: PeerId = peer.parse()?;
        if remote_peer == self.peer_id {
            anyhow::bail!("dialed ourselves at {addr}");
        }
        let remote_addr = socket.peer_addr().unwrap_or(addr);
        let conn = self.add_conn(remote_peer, &socket, remote_addr, PeerAddr::new(addr));
        self.start(&conn, socket);
        Ok(conn)
    }

    pub async fn close_all(&self) {
        let conns: Vec<Arc<TcpConn>> = self.conns.iter().map(|c| c.value().clone()).collect();
        for conn in conns {
            conn.close().await;
        }
    }

    fn link_preamble(&self) -> Preamble {
        Preamble::Link {
            peer: self.peer_id.to_string(),
            listen_addr: self.listen_addr.to_string(),
        }
    }

    async fn accept(self: Arc<Self>, mut socket: TcpStream, from: SocketAddr) -> Result<()> {
        let preamble = timeout(
            HANDSHAKE_TIMEOUT,
            wire::read_message::<_, Preamble>(&mut socket, PREAMBLE_MAX),
        )
        .await
        .context("preamble timed out")??;

        match preamble {
            Preamble::Link { peer, listen_addr } => {
                let remote_peer: PeerId = peer.parse()?;
                if remote_peer == self.peer_id {
                    anyhow::bail!("link from ourselves");
                }
                let claimed: SocketAddr = listen_addr.parse()?;
                // Registered before replying so the dialer's first stream
                // finds the connection.
                let conn = self.add_conn(remote_peer, &socket, from, reachable_addr(claimed, from));
                if let Err(e) = wire::write_message(&mut socket, &self.link_preamble(), PREAMBLE_MAX).await {
                    self.conns.remove(&conn.id);
                    return Err(e.into());
                }
                self.start(&conn, socket);
                Ok(())
            }
            Preamble::Stream { peer, protocol } => {
                self.accept_stream(socket, peer.parse()?, protocol).await
            }
        }
    }

    async fn accept_stream(&self, mut socket: TcpStream, peer: PeerId, protocol: String) -> Result<()> {
        let conn = self
            .conns
            .iter()
            .find(|c| c.remote_peer == peer)
            .map(|c| c.value().clone());
        let accepted = conn.is_some() && self.router.supports(&protocol);
        wire::write_message(&mut socket, &Ack { accepted }, PREAMBLE_MAX).await?;

        let Some(conn) = conn.filter(|_| accepted) else {
            tracing::debug!(peer = %peer.short(), protocol = %protocol, "stream rejected");
            return Ok(());
        };
        let stream = TcpIdentStream {
            conn,
            io: Some(socket),
            protocol: Some(protocol),
        };
        self.router.handle(Box::new(stream)).await;
        Ok(())
    }

    /// Register a connection over `link`, which reached us from `remote_addr`.
    /// Streams to the peer go to `dial_addr`.
    fn add_conn(
        self: &Arc<Self>,
        remote_peer: PeerId,
        link: &TcpStream,
        remote_addr: SocketAddr,
        dial_addr: PeerAddr,
    ) -> Arc<TcpConn> {
        let local_addr = link
            .local_addr()
            .map(PeerAddr::new)
            .unwrap_or(self.listen_addr);
        let conn = Arc::new_cyclic(|me| TcpConn {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            host: Arc::downgrade(self),
            local_peer: self.peer_id,
            remote_peer,
            local_addr,
            remote_addr: PeerAddr::new(remote_addr),
            dial_addr,
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });
        self.conns.insert(conn.id, conn.clone());
        conn
    }

    /// Watch the link socket and tell the watcher about the connection.
    fn start(&self, conn: &Arc<TcpConn>, socket: TcpStream) {
        tracing::info!(
            peer = %conn.remote_peer.short(),
            addr = %conn.remote_addr,
            conn = conn.id,
            "connection established"
        );
        tokio::spawn(watch_link(conn.clone(), socket));
        if let Some(watcher) = self.watcher.get() {
            watcher.connected(conn.clone());
        }
    }
}

/// Hold the link socket open until either side closes it.
async fn watch_link(conn: Arc<TcpConn>, mut socket: TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = conn.closed.cancelled() => return,
            read = socket.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    conn.close().await;
}

#[async_trait]
impl Network for TcpHost {
    fn local_peer(&self) -> PeerId {
        self.peer_id
    }

    fn listen_addrs(&self) -> Vec<PeerAddr> {
        self.announce.clone()
    }

    fn protocols(&self) -> Vec<String> {
        self.router.protocols()
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

pub struct TcpConn {
    id: ConnId,
    me: Weak<TcpConn>,
    host: Weak<TcpHost>,
    local_peer: PeerId,
    remote_peer: PeerId,
    local_addr: PeerAddr,
    remote_addr: PeerAddr,
    /// Where the peer accepts streams.
    dial_addr: PeerAddr,
    closing: AtomicBool,
    closed: CancellationToken,
}

#[async_trait]
impl Connection for TcpConn {
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
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let conn = self.me.upgrade().ok_or(TransportError::Closed)?;
        let io = TcpStream::connect(self.dial_addr.socket_addr())
            .await
            .map_err(|e| TransportError::StreamOpen(e.to_string()))?;
        Ok(Box::new(TcpIdentStream {
            conn,
            io: Some(io),
            protocol: None,
        }))
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        let Some(host) = self.host.upgrade() else { return };
        host.conns.remove(&self.id);
        tracing::info!(peer = %self.remote_peer.short(), conn = self.id, "connection closed");
        if let Some(watcher) = host.watcher.get() {
            watcher.disconnected(self).await;
        }
    }
}

// ── Stream ────────────────────────────────────────────────────────────────────

pub struct TcpIdentStream {
    conn: Arc<TcpConn>,
    io: Option<TcpStream>,
    protocol: Option<String>,
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
}

#[async_trait]
impl Stream for TcpIdentStream {
    fn conn(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }

    fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    async fn select_protocol(&mut self, protocol: &str) -> Result<(), TransportError> {
        let preamble = Preamble::Stream {
            peer: self.conn.local_peer.to_string(),
            protocol: protocol.to_string(),
        };
        let io = self.io.as_mut().ok_or(TransportError::Closed)?;
        wire::write_message(&mut *io, &preamble, PREAMBLE_MAX)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        let ack: Ack = timeout(HANDSHAKE_TIMEOUT, wire::read_message(&mut *io, PREAMBLE_MAX))
            .await
            .map_err(|_| TransportError::Negotiation("timed out waiting for ack".into()))?
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        if !ack.accepted {
            return Err(TransportError::ProtocolUnsupported(protocol.to_string()));
        }
        self.protocol = Some(protocol.to_string());
        Ok(())
    }

    /// Abort the socket so the remote end reads a reset rather than EOF.
    fn reset(&mut self) {
        if let Some(io) = self.io.take() {
            if let Err(e) = io.set_linger(Some(Duration::ZERO)) {
                tracing::debug!(error = %e, "failed to set linger on reset");
            }
        }
    }
}

impl AsyncRead for TcpIdentStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_read(cx, buf),
            None => Poll::Ready(Err(reset_error())),
        }
    }
}

impl AsyncWrite for TcpIdentStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_write(cx, buf),
            None => Poll::Ready(Err(reset_error())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Err(reset_error())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.io.as_mut() {
            Some(io) => Pin::new(io).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
