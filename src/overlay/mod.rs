//! Per-rank sockets to parent, children, right sibling, and the event bus
//! (spec.md §4.2, component C2).
//!
//! Endpoints are modeled over [`registry::OverlayRegistry`] rather than real
//! network sockets: `parent`/`right` connections are DEALER-like (a single
//! durable outbound sender, plus a reverse-bound identity the peer uses to
//! route replies back); the `child` endpoint is ROUTER-like (one bound
//! receiver fed by every connecting peer, each peer identified by its own
//! reverse identity); the event endpoint is PUB/SUB, relayed down the tree one
//! hop at a time so the root's publications reach every rank (spec.md §9,
//! Open Question 1: a reliable tree broadcast stands in for the original's
//! optional multicast transport).

pub mod registry;

pub use registry::OverlayRegistry;

use crate::error::{BrokerError, Result};
use crate::message::{Identity, Message};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, Mutex};

/// A single durable upstream connection (to the parent, or to the right
/// sibling): an outbound sender, and the reverse identity the peer at the
/// other end uses to route messages back to us.
struct UpstreamLink {
    uri: String,
    tx: mpsc::UnboundedSender<Message>,
    reverse_identity: Identity,
    in_flight: AtomicU32,
}

impl UpstreamLink {
    fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }
}

/// Which role an event endpoint plays when it is bound/connected.
pub enum EventRole {
    /// The tree root: publishes directly, no upstream subscription.
    Root,
    /// Any other rank: subscribes to the parent's event endpoint and relays
    /// every event it sees onto its own bound endpoint.
    NonRoot {
        /// The parent's already-bound/resolved event URI.
        parent_event_uri: String,
    },
}

/// A destination to address with [`Overlay::send`].
pub enum EndpointRef {
    /// The active (head-of-list) parent link.
    Parent,
    /// The right-sibling link, for rank-forwarding.
    Right,
    /// A specific identity previously seen on an inbound message's routing
    /// stack (a child rank or a local caller's reverse address).
    Child(Identity),
}

/// Per-rank overlay: parent chain (with reparenting), child (ROUTER) endpoint,
/// right sibling, and event pub/sub.
pub struct Overlay {
    registry: OverlayRegistry,
    child_uri: RwLock<Option<String>>,
    child_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    upstream: RwLock<Vec<Arc<UpstreamLink>>>,
    upstream_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    upstream_rx_tx: mpsc::UnboundedSender<Message>,
    right: RwLock<Option<Arc<UpstreamLink>>>,
    event_out_uri: RwLock<Option<String>>,
}

impl Overlay {
    /// Creates an overlay with no endpoints bound or connected yet.
    #[must_use]
    pub fn new(registry: OverlayRegistry) -> Self {
        let (upstream_rx_tx, upstream_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            child_uri: RwLock::new(None),
            child_rx: Mutex::new(None),
            upstream: RwLock::new(Vec::new()),
            upstream_rx: Mutex::new(Some(upstream_rx)),
            upstream_rx_tx,
            right: RwLock::new(None),
            event_out_uri: RwLock::new(None),
        }
    }

    /// Binds the child (ROUTER-role) endpoint. Returns the resolved URI (a
    /// wildcard `*` bind has its assigned port recorded here).
    ///
    /// # Errors
    /// Returns [`BrokerError::AlreadyExists`] if `uri` is already bound.
    pub async fn bind_child(&self, uri: &str) -> Result<String> {
        let (resolved, rx) = self.registry.bind(uri)?;
        *self.child_uri.write().unwrap() = Some(resolved.clone());
        *self.child_rx.lock().await = Some(rx);
        Ok(resolved)
    }

    /// The resolved child URI, once bound.
    #[must_use]
    pub fn child_uri(&self) -> Option<String> {
        self.child_uri.read().unwrap().clone()
    }

    /// Takes ownership of the child receiver for the router's event loop.
    /// Call once at startup.
    pub async fn take_child_rx(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.child_rx.lock().await.take()
    }

    /// Takes ownership of the merged upstream receiver (replies/events
    /// arriving via any parent or right-sibling link). Call once at startup.
    pub async fn take_upstream_rx(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.upstream_rx.lock().await.take()
    }

    async fn establish_link(&self, uri: &str) -> Result<Arc<UpstreamLink>> {
        let tx = self.registry.connect(uri)?;
        let (resolved, mut rx) = self.registry.bind(&format!("{uri}#reverse-*"))?;
        let identity = Identity::try_new(resolved)
            .map_err(|e| BrokerError::ProtocolError(format!("invalid reverse identity: {e}")))?;
        let fan_in = self.upstream_rx_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if fan_in.send(msg).is_err() {
                    break;
                }
            }
        });
        Ok(Arc::new(UpstreamLink {
            uri: uri.to_string(),
            tx,
            reverse_identity: identity,
            in_flight: AtomicU32::new(0),
        }))
    }

    /// Connects the (DEALER-role) parent endpoint, making it the active
    /// parent. Equivalent to [`Overlay::reparent`] when no parent exists yet.
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if nothing is bound at `uri`.
    pub async fn connect_parent(&self, uri: &str) -> Result<Identity> {
        self.reparent(uri).await
    }

    /// Reparents to `uri`: if it is already a known upstream link, moves it
    /// to the head (active) position; otherwise connects and prepends it.
    /// Old parent links are never closed here — only [`Overlay::retire_idle_parents`]
    /// removes them, and only once idle.
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if connecting a new URI fails;
    /// the existing list is left untouched in that case.
    pub async fn reparent(&self, uri: &str) -> Result<Identity> {
        {
            let mut upstream = self.upstream.write().unwrap();
            if let Some(pos) = upstream.iter().position(|l| l.uri == uri) {
                let link = upstream.remove(pos);
                let identity = link.reverse_identity.clone();
                upstream.insert(0, link);
                return Ok(identity);
            }
        }
        let link = self.establish_link(uri).await?;
        let identity = link.reverse_identity.clone();
        self.upstream.write().unwrap().insert(0, link);
        Ok(identity)
    }

    /// Removes any non-active upstream link with no in-flight traffic.
    pub fn retire_idle_parents(&self) {
        let mut upstream = self.upstream.write().unwrap();
        if upstream.len() <= 1 {
            return;
        }
        let head = upstream.first().map(|link| Arc::as_ptr(link));
        let registry = self.registry.clone();
        upstream.retain(|link| {
            let is_head = head == Some(Arc::as_ptr(link));
            let keep = is_head || !link.is_idle();
            if !keep {
                registry.unbind(link.reverse_identity.as_ref());
            }
            keep
        });
    }

    /// Connects the right-sibling endpoint, used for rank-forwarding.
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if nothing is bound at `uri`.
    pub async fn connect_right(&self, uri: &str) -> Result<Identity> {
        let link = self.establish_link(uri).await?;
        let identity = link.reverse_identity.clone();
        *self.right.write().unwrap() = Some(link);
        Ok(identity)
    }

    /// Binds (root) or connects-and-relays (non-root) the event endpoint.
    /// Returns the resolved URI local modules and child ranks subscribe to.
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if a non-root rank's parent
    /// event URI is not yet bound.
    pub fn bind_or_connect_event(&self, uri: &str, role: EventRole) -> Result<String> {
        let resolved = self.registry.bind_pub(uri);
        *self.event_out_uri.write().unwrap() = Some(resolved.clone());
        if let EventRole::NonRoot { parent_event_uri } = role {
            let mut upstream_rx = self.registry.subscribe_pub(&parent_event_uri)?;
            let registry = self.registry.clone();
            let out_uri = resolved.clone();
            tokio::spawn(async move {
                loop {
                    match upstream_rx.recv().await {
                        Ok(event) => {
                            let _ = registry.publish(&out_uri, event);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
        Ok(resolved)
    }

    /// The resolved event URI, once bound.
    #[must_use]
    pub fn event_uri(&self) -> Option<String> {
        self.event_out_uri.read().unwrap().clone()
    }

    /// Publishes `msg` on this rank's event endpoint (reaches local
    /// subscribers and, for non-root ranks relaying, any children).
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if the event endpoint is not bound.
    pub fn publish_event(&self, msg: Message) -> Result<()> {
        let uri = self
            .event_out_uri
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| BrokerError::TransportError("event endpoint not bound".to_string()))?;
        self.registry.publish(&uri, msg)
    }

    /// Subscribes to this rank's event endpoint (used by local modules).
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if the event endpoint is not bound.
    pub fn subscribe_event(&self) -> Result<broadcast::Receiver<Message>> {
        let uri = self
            .event_out_uri
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| BrokerError::TransportError("event endpoint not bound".to_string()))?;
        self.registry.subscribe_pub(&uri)
    }

    /// Sends `msg` to the given endpoint.
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if the endpoint has no live
    /// connection, or [`BrokerError::HostUnreachable`] translated by the
    /// caller for rank-forward loop detection.
    pub fn send(&self, endpoint: &EndpointRef, mut msg: Message) -> Result<()> {
        match endpoint {
            EndpointRef::Parent => {
                let upstream = self.upstream.read().unwrap();
                let link = upstream
                    .first()
                    .ok_or_else(|| BrokerError::TransportError("no active parent".to_string()))?;
                msg.push_identity(link.reverse_identity.clone());
                link.in_flight.fetch_add(1, Ordering::AcqRel);
                link.tx
                    .send(msg)
                    .map_err(|e| BrokerError::TransportError(e.to_string()))
            }
            EndpointRef::Right => {
                let right = self.right.read().unwrap();
                let link = right
                    .as_ref()
                    .ok_or_else(|| BrokerError::TransportError("no right sibling".to_string()))?;
                msg.push_identity(link.reverse_identity.clone());
                link.in_flight.fetch_add(1, Ordering::AcqRel);
                link.tx
                    .send(msg)
                    .map_err(|e| BrokerError::TransportError(e.to_string()))
            }
            EndpointRef::Child(identity) => {
                let tx = self.registry.connect(identity.as_ref())?;
                tx.send(msg)
                    .map_err(|e| BrokerError::TransportError(e.to_string()))
            }
        }
    }

    /// The active (head) parent's reverse identity, if connected.
    #[must_use]
    pub fn active_parent_identity(&self) -> Option<Identity> {
        self.upstream
            .read()
            .unwrap()
            .first()
            .map(|link| link.reverse_identity.clone())
    }

    /// The right sibling's reverse identity, if connected.
    #[must_use]
    pub fn right_identity(&self) -> Option<Identity> {
        self.right.read().unwrap().as_ref().map(|link| link.reverse_identity.clone())
    }

    /// Marks a reply as having arrived on the active parent link, decrementing
    /// its in-flight counter so it becomes eligible for retirement once
    /// superseded and idle.
    pub fn note_parent_reply_drained(&self) {
        if let Some(link) = self.upstream.read().unwrap().first() {
            link.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            }).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Topic;

    fn topic(s: &str) -> Topic {
        Topic::try_new(s).unwrap()
    }

    #[tokio::test]
    async fn connect_parent_then_send_delivers_with_identity() {
        let registry = OverlayRegistry::new();
        let parent = Overlay::new(registry.clone());
        let parent_uri = parent.bind_child("inproc://t/parent-child").await.unwrap();
        let mut parent_rx = parent.take_child_rx().await.unwrap();

        let child = Overlay::new(registry.clone());
        let identity = child.connect_parent(&parent_uri).await.unwrap();

        child
            .send(&EndpointRef::Parent, Message::request(topic("kvs.get"), None))
            .unwrap();
        let received = parent_rx.recv().await.unwrap();
        assert_eq!(received.peek_identity(), Some(&identity));
    }

    #[tokio::test]
    async fn reparent_moves_existing_uri_to_head() {
        let registry = OverlayRegistry::new();
        let old_parent = Overlay::new(registry.clone());
        let old_uri = old_parent.bind_child("inproc://t/old-parent").await.unwrap();
        let new_parent = Overlay::new(registry.clone());
        let new_uri = new_parent.bind_child("inproc://t/new-parent").await.unwrap();

        let child = Overlay::new(registry.clone());
        child.connect_parent(&old_uri).await.unwrap();
        child.connect_parent(&new_uri).await.unwrap();
        assert_eq!(child.upstream.read().unwrap().len(), 2);
        assert_eq!(child.upstream.read().unwrap()[0].uri, new_uri);

        // Reparenting back to the old URI should move it to head without
        // adding a third entry.
        child.reparent(&old_uri).await.unwrap();
        assert_eq!(child.upstream.read().unwrap().len(), 2);
        assert_eq!(child.upstream.read().unwrap()[0].uri, old_uri);
    }

    #[tokio::test]
    async fn event_relays_down_the_tree() {
        let registry = OverlayRegistry::new();
        let root = Overlay::new(registry.clone());
        let root_event_uri = root.bind_or_connect_event("inproc://t/root-event", EventRole::Root).unwrap();

        let mid = Overlay::new(registry.clone());
        let mid_event_uri = mid
            .bind_or_connect_event(
                "inproc://t/mid-event",
                EventRole::NonRoot { parent_event_uri: root_event_uri },
            )
            .unwrap();
        let mut mid_sub = mid.subscribe_event().unwrap();

        let leaf = Overlay::new(registry.clone());
        leaf.bind_or_connect_event(
            "inproc://t/leaf-event",
            EventRole::NonRoot { parent_event_uri: mid_event_uri },
        )
        .unwrap();
        let mut leaf_sub = leaf.subscribe_event().unwrap();

        root.publish_event(Message::event(topic("kvs.setroot.1.abc"), None)).unwrap();

        let at_mid = mid_sub.recv().await.unwrap();
        assert!(at_mid.matches("kvs.setroot.1.abc"));
        let at_leaf = leaf_sub.recv().await.unwrap();
        assert!(at_leaf.matches("kvs.setroot.1.abc"));
    }
}
