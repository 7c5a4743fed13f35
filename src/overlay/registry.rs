//! In-process transport: resolves overlay URIs to channel endpoints.
//!
//! Flux's bootstrap mechanism (peer discovery, rank assignment) is an external
//! collaborator (spec.md §1); what the overlay needs from it is just "a URI
//! resolves to a live endpoint to bind or connect." This registry is that
//! resolution, implemented over `tokio::sync::mpsc` channels shared within one
//! process — the concrete choice the Open Questions in spec.md §9 leave to the
//! implementation (a reliable fan-out rather than unreliable multicast).

use crate::error::{BrokerError, Result};
use crate::message::Message;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Broadcast channel capacity for PUB endpoints. Generous since events are
/// expected to be drained promptly by the relay/subscriber tasks.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Shared registry mapping bound URIs to their inbound channel.
#[derive(Clone, Default)]
pub struct OverlayRegistry {
    bound: Arc<DashMap<String, mpsc::UnboundedSender<Message>>>,
    pub_bound: Arc<DashMap<String, broadcast::Sender<Message>>>,
    next_port: Arc<AtomicU64>,
}

impl OverlayRegistry {
    /// Creates a fresh, empty registry. Typically one per session (shared by
    /// every rank constructed in the same process for tests).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `uri` to a freshly created channel, returning the resolved URI
    /// (wildcard `*` suffix replaced with an assigned sequence number) and
    /// the receiver side.
    ///
    /// # Errors
    /// Returns [`BrokerError::AlreadyExists`] if the resolved URI is already bound.
    pub fn bind(&self, uri: &str) -> Result<(String, mpsc::UnboundedReceiver<Message>)> {
        let resolved = if let Some(prefix) = uri.strip_suffix('*') {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            format!("{prefix}{port}")
        } else {
            uri.to_string()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        if self.bound.contains_key(&resolved) {
            return Err(BrokerError::AlreadyExists(format!(
                "endpoint already bound: {resolved}"
            )));
        }
        self.bound.insert(resolved.clone(), tx);
        Ok((resolved, rx))
    }

    /// Resolves `uri` to a sender, for a connecting peer.
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if nothing is bound at `uri`.
    pub fn connect(&self, uri: &str) -> Result<mpsc::UnboundedSender<Message>> {
        self.bound
            .get(uri)
            .map(|entry| entry.clone())
            .ok_or_else(|| BrokerError::TransportError(format!("no endpoint bound at {uri}")))
    }

    /// Removes a bound endpoint, e.g. on overlay shutdown or retirement of a
    /// retired parent link.
    pub fn unbind(&self, uri: &str) {
        self.bound.remove(uri);
    }

    /// Binds a PUB endpoint: many subscribers may attach via
    /// [`OverlayRegistry::subscribe_pub`]. Re-binding an already-bound PUB
    /// URI returns the existing sender (idempotent — a rank rebuilding its
    /// event endpoint after a reparent should not orphan subscribers).
    pub fn bind_pub(&self, uri: &str) -> String {
        let resolved = if let Some(prefix) = uri.strip_suffix('*') {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            format!("{prefix}{port}")
        } else {
            uri.to_string()
        };
        self.pub_bound
            .entry(resolved.clone())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0);
        resolved
    }

    /// Publishes `msg` on the PUB endpoint bound at `uri`. Silently a no-op if
    /// there are currently no subscribers (broadcast semantics).
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if `uri` was never bound.
    pub fn publish(&self, uri: &str, msg: Message) -> Result<()> {
        let sender = self
            .pub_bound
            .get(uri)
            .ok_or_else(|| BrokerError::TransportError(format!("no PUB endpoint bound at {uri}")))?;
        let _ = sender.send(msg);
        Ok(())
    }

    /// Subscribes to the PUB endpoint bound at `uri`.
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if `uri` was never bound.
    pub fn subscribe_pub(&self, uri: &str) -> Result<broadcast::Receiver<Message>> {
        self.pub_bound
            .get(uri)
            .map(|entry| entry.subscribe())
            .ok_or_else(|| BrokerError::TransportError(format!("no PUB endpoint bound at {uri}")))
    }
}
