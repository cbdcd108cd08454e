//! Subscription registry owned by a socket connection.
//!
//! Entries are keyed by a local [`SubscriptionKey`] that stays stable for the
//! life of the caller's handle; the server-assigned id can change when the
//! subscription is replayed on a fresh connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::request::JsonRpcRequest;

/// Local, connection-independent handle for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionKey(pub u64);

/// Server id of a subscription, shared with the caller's handle so re-keying
/// after a replay is visible from both sides.
pub type SharedServerId = Arc<Mutex<String>>;

/// Items delivered to a subscriber.
pub type SubscriptionItem = Result<Value, TransportError>;

struct SubscriptionEntry {
    /// Subscribe request as first sent, re-sent on replay.
    request: JsonRpcRequest,
    server_id: SharedServerId,
    sender: mpsc::UnboundedSender<SubscriptionItem>,
    /// `false` between a connection drop and a successful replay.
    attached: bool,
}

/// Active subscriptions of one connection, routed by server id.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<SubscriptionKey, SubscriptionEntry>,
    by_server_id: HashMap<String, SubscriptionKey>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription the server just acknowledged.
    pub fn register(
        &mut self,
        key: SubscriptionKey,
        server_id: SharedServerId,
        request: JsonRpcRequest,
        sender: mpsc::UnboundedSender<SubscriptionItem>,
    ) {
        let id = server_id.lock().clone();
        self.by_server_id.insert(id, key);
        self.entries.insert(
            key,
            SubscriptionEntry {
                request,
                server_id,
                sender,
                attached: true,
            },
        );
    }

    /// Forward an incoming notification to the matching subscriber.
    ///
    /// Returns `false` if no live subscriber took it; a subscriber whose
    /// receiver is gone is dropped from the registry.
    pub fn dispatch(&mut self, server_id: &str, message: Value) -> bool {
        let Some(&key) = self.by_server_id.get(server_id) else {
            return false;
        };
        let delivered = self
            .entries
            .get(&key)
            .map(|e| e.sender.send(Ok(message)).is_ok())
            .unwrap_or(false);
        if !delivered {
            self.remove(key);
        }
        delivered
    }

    /// Remove a subscription, returning its current server id if it was
    /// attached to the live connection.
    pub fn remove(&mut self, key: SubscriptionKey) -> Option<String> {
        let entry = self.entries.remove(&key)?;
        let id = entry.server_id.lock().clone();
        if entry.attached {
            self.by_server_id.remove(&id);
            Some(id)
        } else {
            None
        }
    }

    /// Mark every subscription as detached after the connection dropped.
    pub fn detach_all(&mut self) {
        self.by_server_id.clear();
        for entry in self.entries.values_mut() {
            entry.attached = false;
        }
    }

    /// `(key, request)` of every registered subscription in registration order.
    pub fn replay_requests(&self) -> Vec<(SubscriptionKey, JsonRpcRequest)> {
        self.entries
            .iter()
            .map(|(k, e)| (*k, e.request.clone()))
            .collect()
    }

    /// Attach a replayed subscription under its new server id.
    /// Returns `false` if the subscription was removed in the meantime.
    pub fn rekey(&mut self, key: SubscriptionKey, new_server_id: String) -> bool {
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        *entry.server_id.lock() = new_server_id.clone();
        entry.attached = true;
        self.by_server_id.insert(new_server_id, key);
        true
    }

    /// Push a terminal error to one subscriber and drop it.
    pub fn fail(&mut self, key: SubscriptionKey, error: TransportError) {
        if let Some(entry) = self.entries.get(&key) {
            let _ = entry.sender.send(Err(error));
        }
        self.remove(key);
    }

    /// Push a terminal error to every subscriber and clear the registry.
    pub fn fail_all(&mut self, error: &TransportError) {
        for entry in self.entries.values() {
            let _ = entry.sender.send(Err(error.clone()));
        }
        self.entries.clear();
        self.by_server_id.clear();
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no registered subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
