//! Per-connection identify tickets.
//!
//! The first caller to ask about a connection creates its ticket and starts
//! the exchange; every later caller gets a clone of the same signal. The
//! map is read-locked on the common path and write-locked, with a re-check,
//! only when a ticket has to be created. Tickets live until the connection
//! disconnects, so a finished ticket answers "already identified".

use std::sync::{Arc, PoisonError};

use ident_core::wire::{self, IdentifyMessage};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use super::{IdService, IdentifyError};
use crate::events::IdentifyEvent;
use crate::transport::{ConnId, Connection};

type Outcome = Option<Result<(), IdentifyError>>;

/// Fires once when a connection's identify exchange ends.
#[derive(Clone)]
pub struct IdentifySignal {
    rx: watch::Receiver<Outcome>,
}

impl IdentifySignal {
    fn new() -> (watch::Sender<Outcome>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// Wait for the exchange to end. Returns immediately if it already has.
    pub async fn wait(&self) -> Result<(), IdentifyError> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(IdentifyError::Abandoned))
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The result, if the exchange has ended.
    pub fn outcome(&self) -> Outcome {
        self.rx.borrow().clone()
    }
}

impl IdService {
    /// Make sure `conn` is identified, starting the exchange if nobody has.
    /// Repeated calls for a live connection return the same signal.
    pub fn identify_wait(&self, conn: Arc<dyn Connection>) -> IdentifySignal {
        let id = conn.id();
        {
            let conns = self
                .inner
                .conns
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(signal) = conns.get(&id) {
                return signal.clone();
            }
        }

        let (tx, signal) = {
            let mut conns = self
                .inner
                .conns
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            // Another caller may have won the race for the write lock.
            if let Some(signal) = conns.get(&id) {
                return signal.clone();
            }
            let (tx, signal) = IdentifySignal::new();
            conns.insert(id, signal.clone());
            (tx, signal)
        };

        let service = self.clone();
        tokio::spawn(async move {
            let outcome = service.run_identify(conn).await;
            tx.send_replace(Some(outcome));
        });
        signal
    }

    /// Identify `conn` and wait for the result.
    pub async fn identify_conn(&self, conn: Arc<dyn Connection>) -> Result<(), IdentifyError> {
        self.identify_wait(conn).wait().await
    }

    /// Forget the ticket for a connection. Called on disconnect.
    pub fn remove_conn(&self, id: ConnId) {
        self.inner
            .conns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Whether a ticket exists for the connection.
    pub fn has_ticket(&self, id: ConnId) -> bool {
        self.inner
            .conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn ticket_count(&self) -> usize {
        self.inner
            .conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn run_identify(&self, conn: Arc<dyn Connection>) -> Result<(), IdentifyError> {
        let peer = conn.remote_peer();
        let result = self.request_identify(&conn).await;
        match &result {
            Ok(()) => {
                tracing::debug!(peer = %peer.short(), conn = conn.id(), "identify completed");
                self.inner
                    .bus
                    .emit(IdentifyEvent::PeerIdentificationCompleted { peer });
            }
            Err(e) => {
                tracing::debug!(peer = %peer.short(), conn = conn.id(), error = %e, "identify failed");
                self.inner.bus.emit(IdentifyEvent::PeerIdentificationFailed {
                    peer,
                    reason: e.clone(),
                });
            }
        }
        result
    }

    /// Requester side: open a stream, negotiate, read one payload, apply it.
    async fn request_identify(&self, conn: &Arc<dyn Connection>) -> Result<(), IdentifyError> {
        let peer = conn.remote_peer();
        let retries = self.inner.settings.negotiation_retries;
        let mut attempt = 0u32;

        let mut stream = loop {
            let mut stream = match conn.new_stream().await {
                Ok(s) => s,
                Err(e) => {
                    // A peer we cannot open a stream to is treated as gone.
                    tracing::debug!(peer = %peer.short(), error = %e, "cannot open identify stream");
                    conn.close().await;
                    self.remove_conn(conn.id());
                    return Err(IdentifyError::StreamOpen(e.to_string()));
                }
            };
            match stream.select_protocol(wire::ID).await {
                Ok(()) => break stream,
                Err(e) => {
                    stream.reset();
                    if attempt >= retries {
                        return Err(IdentifyError::Negotiation(e.to_string()));
                    }
                    attempt += 1;
                    tracing::debug!(peer = %peer.short(), attempt, error = %e, "retrying identify negotiation");
                }
            }
        };

        let msg: IdentifyMessage =
            match wire::read_message(&mut stream, self.inner.settings.max_message_size).await {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(peer = %peer.short(), error = %e, "error reading identify message");
                    stream.reset();
                    return Err(IdentifyError::Read(e.to_string()));
                }
            };

        tokio::spawn(async move {
            let _ = stream.shutdown().await;
        });

        self.consume_message(msg, conn).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use ident_core::config::IdentifyConfig;

    use super::*;
    use crate::testing::{next_event, TestNode};

    #[tokio::test]
    async fn concurrent_requests_share_one_exchange() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let (conn, _) = a.connect(&b);

        let waits = (0..16).map(|_| {
            let service = a.service.clone();
            let conn = conn.clone();
            tokio::spawn(async move { service.identify_conn(conn).await })
        });
        for res in join_all(waits).await {
            assert!(res.unwrap().is_ok());
        }
        assert_eq!(a.host.opened_count(&b.peer_id(), wire::ID), 1);
        assert!(a.service.has_ticket(conn.id()));
    }

    #[tokio::test]
    async fn finished_ticket_answers_immediately() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let (conn, _) = a.connect_and_identify(&b).await.unwrap();

        let signal = a.service.identify_wait(conn.clone());
        assert!(signal.is_done());
        assert!(matches!(signal.outcome(), Some(Ok(()))));
        signal.wait().await.unwrap();
        assert_eq!(a.host.opened_count(&b.peer_id(), wire::ID), 1);
    }

    #[tokio::test]
    async fn removed_ticket_is_recreated() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let (conn, _) = a.connect_and_identify(&b).await.unwrap();

        a.service.remove_conn(conn.id());
        assert!(!a.service.has_ticket(conn.id()));
        a.service.identify_conn(conn.clone()).await.unwrap();
        assert_eq!(a.host.opened_count(&b.peer_id(), wire::ID), 2);
    }

    #[tokio::test]
    async fn stream_open_failure_drops_connection() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        a.host.set_fail_stream_open(true);
        let mut events = a.bus.subscribe();

        let (conn, _) = a.connect(&b);
        let res = a.service.identify_conn(conn.clone()).await;
        assert!(matches!(res, Err(IdentifyError::StreamOpen(_))));
        assert!(conn.is_closed());
        assert!(!a.service.has_ticket(conn.id()));
        assert_eq!(a.host.conn_count(), 0);

        let failed = next_event(&mut events, |e| {
            matches!(e, IdentifyEvent::PeerIdentificationFailed { .. })
        })
        .await;
        match failed {
            Some(IdentifyEvent::PeerIdentificationFailed { peer, reason }) => {
                assert_eq!(peer, b.peer_id());
                assert!(matches!(reason, IdentifyError::StreamOpen(_)));
            }
            other => panic!("expected failure event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn negotiation_failure_keeps_connection() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        b.host.set_protocols(vec![wire::ID_PUSH.to_string()]);

        let (conn, _) = a.connect(&b);
        let res = a.service.identify_conn(conn.clone()).await;
        assert!(matches!(res, Err(IdentifyError::Negotiation(_))));
        assert!(!conn.is_closed());
        assert!(a.service.has_ticket(conn.id()));
        assert_eq!(a.host.reset_count(), 1);
    }

    #[tokio::test]
    async fn negotiation_is_retried_when_configured() {
        let settings = IdentifyConfig {
            negotiation_retries: 2,
            ..IdentifyConfig::default()
        };
        let a = TestNode::with_settings(&["10.0.0.1:4001"], settings);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        b.host.set_protocols(Vec::new());

        let (conn, _) = a.connect(&b);
        let res = a.service.identify_conn(conn.clone()).await;
        assert!(matches!(res, Err(IdentifyError::Negotiation(_))));
        assert_eq!(a.host.opened_count(&b.peer_id(), wire::ID), 3);
    }

    #[tokio::test]
    async fn success_emits_completion_event() {
        let a = TestNode::new(&["10.0.0.1:4001"]);
        let b = TestNode::new(&["10.0.0.2:4001"]);
        let mut events = a.bus.subscribe();
        a.connect_and_identify(&b).await.unwrap();

        let done = next_event(&mut events, |e| {
            matches!(e, IdentifyEvent::PeerIdentificationCompleted { .. })
        })
        .await;
        assert!(matches!(
            done,
            Some(IdentifyEvent::PeerIdentificationCompleted { peer }) if peer == b.peer_id()
        ));
    }
}
