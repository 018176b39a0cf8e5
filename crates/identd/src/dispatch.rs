//! Routes inbound streams to the handler registered for their protocol.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use ident_services::{BoxStream, EventBus, IdentifyEvent, StreamHandler};

/// Maps protocol ids to stream handlers.
///
/// Every change to the registered set is announced on the event bus as
/// `LocalProtocolsUpdated`, which the identify service turns into delta
/// pushes to connected peers.
pub struct ProtocolRouter {
    handlers: RwLock<BTreeMap<String, Arc<dyn StreamHandler>>>,
    bus: EventBus,
}

impl ProtocolRouter {
    pub fn new(bus: EventBus) -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            bus,
        }
    }

    /// Register `handler` for `protocol`, replacing any previous one.
    pub fn register(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.to_string(), handler)
            .is_some();
        if !replaced {
            tracing::debug!(protocol, "protocol registered");
            self.bus.emit(IdentifyEvent::LocalProtocolsUpdated {
                added: vec![protocol.to_string()],
                removed: Vec::new(),
            });
        }
    }

    /// Stop handling `protocol`. Returns false if it was not registered.
    pub fn unregister(&self, protocol: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(protocol)
            .is_some();
        if removed {
            tracing::debug!(protocol, "protocol unregistered");
            self.bus.emit(IdentifyEvent::LocalProtocolsUpdated {
                added: Vec::new(),
                removed: vec![protocol.to_string()],
            });
        }
        removed
    }

    pub fn supports(&self, protocol: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(protocol)
    }

    /// Registered protocols, sorted.
    pub fn protocols(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn handler_for(&self, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
    }
}

#[async_trait]
impl StreamHandler for ProtocolRouter {
    async fn handle(&self, mut stream: BoxStream) {
        let handler = stream.protocol().and_then(|p| self.handler_for(p));
        match handler {
            Some(handler) => handler.handle(stream).await,
            None => {
                tracing::debug!(protocol = ?stream.protocol(), "no handler for stream");
                stream.reset();
            }
        }
    }
}
