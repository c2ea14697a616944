//! Service directory and local handler registry.
//!
//! [`ServiceDirectory`] answers "which connected peers offer service X". It is
//! fed by the Hello each peer sends at admission and drained when that peer's
//! connection closes. The local node never appears in it.
//!
//! [`HandlerRegistry`] maps the service names this node offers to callbacks.
//! It is built before the node starts and frozen afterwards; its names are
//! what the node advertises.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::identity::NodeId;

#[derive(Debug)]
pub struct ServiceDirectory {
    local_id: NodeId,
    providers: HashMap<String, HashSet<NodeId>>,
    services: HashMap<NodeId, Vec<String>>,
}

impl ServiceDirectory {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            providers: HashMap::new(),
            services: HashMap::new(),
        }
    }

    /// Record that `peer` offers `services`, replacing whatever it advertised
    /// before. Ignored for the local ID.
    pub fn advertise(&mut self, peer: NodeId, services: &[String]) {
        if peer == self.local_id {
            return;
        }
        self.withdraw(&peer);

        let mut names: Vec<String> = Vec::with_capacity(services.len());
        for service in services {
            if names.contains(service) {
                continue;
            }
            self.providers
                .entry(service.clone())
                .or_default()
                .insert(peer);
            names.push(service.clone());
        }
        if !names.is_empty() {
            self.services.insert(peer, names);
        }
    }

    /// Peers currently advertising `service`, sorted for stable output.
    pub fn providers_for(&self, service: &str) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .providers
            .get(service)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Remove `peer` from every service. Returns the services it had.
    pub fn withdraw(&mut self, peer: &NodeId) -> Vec<String> {
        let Some(names) = self.services.remove(peer) else {
            return Vec::new();
        };
        for name in &names {
            if let Some(set) = self.providers.get_mut(name) {
                set.remove(peer);
                if set.is_empty() {
                    self.providers.remove(name);
                }
            }
        }
        names
    }

    pub fn services_of(&self, peer: &NodeId) -> Vec<String> {
        self.services.get(peer).cloned().unwrap_or_default()
    }

    /// Number of distinct services with at least one provider.
    pub fn len(&self) -> usize {
        self.providers.len()
    }
}

/// A message delivered to a local service handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: NodeId,
    pub public_key: [u8; 32],
    pub service: String,
    pub payload: Vec<u8>,
}

pub type Handler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `service`, replacing any previous one.
    pub fn register<F>(&mut self, service: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.handlers.insert(service.into(), Arc::new(handler));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, service: impl Into<String>, handler: F) -> Self
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.register(service, handler);
        self
    }

    /// Advertised service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, service: &str) -> bool {
        self.handlers.contains_key(service)
    }

    /// Hand `message` to its service's handler. Returns false when no handler
    /// is registered for it.
    pub fn dispatch(&self, message: InboundMessage) -> bool {
        match self.handlers.get(&message.service) {
            Some(handler) => {
                handler(message);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("services", &self.names())
            .finish()
    }
}
