//! Request/response/event dispatch (spec.md §4.3, component C3): the
//! cooperative task that owns the KVS engine and module host, classifies
//! every inbound frame, and forwards what it cannot answer locally.
//!
//! Grounded on the teacher's `message_router::Router` for the overall
//! select-loop shape (one task draining several channels, dispatching by
//! message kind) and its `PendingRequests` correlation table, generalized
//! from a flat agent mesh to a tree: replies that cross a link are retraced
//! hop by hop via the routing stack rather than a single direct channel.

pub mod peer;

pub use peer::PeerTable;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::kvs::{CommitName, EventPublisher, KvsEngine, Reference, RootRef, UpstreamCaller};
use crate::message::{Identity, Message, MessageKind, Topic};
use crate::module_host::ModuleHost;
use crate::observability::Metrics;
use crate::overlay::{EndpointRef, Overlay};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, OnceCell};

const SNOOP_CHANNEL_CAPACITY: usize = 1024;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// The per-rank request/response/event router.
pub struct Router {
    config: Arc<BrokerConfig>,
    overlay: Arc<Overlay>,
    modules: ModuleHost,
    module_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    kvs: OnceCell<Arc<KvsEngine>>,
    peers: PeerTable,
    inflight: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    next_corr: AtomicU64,
    metrics: Arc<dyn Metrics>,
    snoop_tx: broadcast::Sender<Message>,
    snoop_uri: String,
}

/// Feeds KVS root-epoch events onto this rank's event endpoint, breaking the
/// `Router` <-> `KvsEngine` construction cycle (the engine only needs to
/// *publish*, never to route).
struct RouterEventPublisher {
    overlay: Arc<Overlay>,
}

#[async_trait]
impl EventPublisher for RouterEventPublisher {
    async fn publish_setroot(&self, root: &RootRef) {
        let Ok(topic) = Topic::try_new(format!("event.kvs.setroot.{root}")) else {
            tracing::warn!(%root, "root reference does not form a valid event topic");
            return;
        };
        if let Err(e) = self.overlay.publish_event(Message::event(topic, None)) {
            tracing::warn!(%e, "failed publishing setroot event");
        }
    }
}

impl Router {
    /// Builds a router for `config`, wired to `overlay`. The KVS engine is
    /// installed separately via [`Router::install_kvs`] once the router
    /// itself is behind an `Arc` (the engine's `UpstreamCaller` is `self`).
    #[must_use]
    pub fn new(config: Arc<BrokerConfig>, overlay: Arc<Overlay>, metrics: Arc<dyn Metrics>) -> Arc<Self> {
        let (to_router, module_rx) = mpsc::unbounded_channel();
        let (snoop_tx, _) = broadcast::channel(SNOOP_CHANNEL_CAPACITY);
        let snoop_uri = format!(
            "ipc://{}/rank-{}/snoop",
            config.session_id, config.rank
        );
        Arc::new(Self {
            config,
            overlay,
            modules: ModuleHost::new(to_router),
            module_rx: Mutex::new(Some(module_rx)),
            kvs: OnceCell::new(),
            peers: PeerTable::new(),
            inflight: Mutex::new(HashMap::new()),
            next_corr: AtomicU64::new(0),
            metrics,
            snoop_tx,
            snoop_uri,
        })
    }

    /// Installs this rank's KVS engine, using `self` as its upstream caller.
    /// Must be called exactly once, before [`Router::run`].
    ///
    /// # Panics
    /// Panics if called more than once.
    pub fn install_kvs(self: &Arc<Self>) -> Arc<KvsEngine> {
        let publisher = Arc::new(RouterEventPublisher { overlay: self.overlay.clone() });
        let engine = if self.is_root() {
            Arc::new(KvsEngine::new_root(publisher, self.metrics.clone()))
        } else {
            Arc::new(KvsEngine::new_non_root(self.clone(), publisher, self.metrics.clone()))
        };
        self.kvs
            .set(engine.clone())
            .unwrap_or_else(|_| panic!("install_kvs called more than once"));
        engine
    }

    /// The installed KVS engine.
    ///
    /// # Panics
    /// Panics if [`Router::install_kvs`] has not been called yet.
    #[must_use]
    pub fn kvs(&self) -> &Arc<KvsEngine> {
        self.kvs.get().expect("install_kvs must run before the router starts")
    }

    /// The module host, for loading modules at startup.
    #[must_use]
    pub fn modules(&self) -> &ModuleHost {
        &self.modules
    }

    /// Whether this rank is the treeroot.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.config.rank.into_inner() == 0
    }

    /// Subscribes to a live feed of every request/response/event this router
    /// processes, tagged with its kind (spec.md §4.3 "Snoop").
    #[must_use]
    pub fn snoop_subscribe(&self) -> broadcast::Receiver<Message> {
        self.snoop_tx.subscribe()
    }

    /// The snoop endpoint's advertised URI, surfaced via `broker.getattr`.
    #[must_use]
    pub fn snoop_uri(&self) -> &str {
        &self.snoop_uri
    }

    fn snoop(&self, msg: &Message) {
        let prefix = match msg.kind() {
            MessageKind::Request => "req",
            MessageKind::Response => "rsp",
            MessageKind::Event => "evt",
        };
        let topic = Topic::try_new(format!("snoop.{prefix}.{}", msg.topic()))
            .unwrap_or_else(|_| msg.topic().clone());
        let _ = self.snoop_tx.send(Message::event(topic, msg.payload().cloned()));
    }

    /// Drives this rank's router forever: pulls from the child, upstream,
    /// and module channels, and a background task relaying subscribed
    /// events into [`Router::handle_inbound_event`].
    pub async fn run(self: Arc<Self>) {
        let mut child_rx = self
            .overlay
            .take_child_rx()
            .await
            .expect("child endpoint must be bound before Router::run");
        let mut upstream_rx = self
            .overlay
            .take_upstream_rx()
            .await
            .expect("Router::run must be called exactly once");
        let mut module_rx = self
            .module_rx
            .lock()
            .await
            .take()
            .expect("Router::run must be called exactly once");

        if let Ok(mut event_rx) = self.overlay.subscribe_event() {
            let router = self.clone();
            tokio::spawn(async move {
                loop {
                    match event_rx.recv().await {
                        Ok(event) => router.handle_inbound_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                maybe_msg = child_rx.recv() => {
                    match maybe_msg {
                        Some(msg) => self.on_child_message(msg).await,
                        None => break,
                    }
                }
                maybe_msg = upstream_rx.recv() => {
                    match maybe_msg {
                        Some(msg) => self.on_upstream_message(msg).await,
                        None => break,
                    }
                }
                maybe_msg = module_rx.recv() => {
                    match maybe_msg {
                        Some(msg) => self.on_module_message(msg).await,
                        None => break,
                    }
                }
                _ = heartbeat.tick() => self.on_heartbeat().await,
            }
        }
    }

    async fn on_child_message(&self, msg: Message) {
        if let Some(id) = msg.peek_identity() {
            self.peers.touch(id);
        }
        match msg.kind() {
            MessageKind::Request => self.handle_request(msg).await,
            MessageKind::Response => self.deliver_response(msg).await,
            MessageKind::Event => {}
        }
    }

    async fn on_upstream_message(&self, msg: Message) {
        match msg.kind() {
            MessageKind::Response => self.deliver_response(msg).await,
            MessageKind::Request => self.handle_request(msg).await,
            MessageKind::Event => {}
        }
    }

    async fn on_module_message(&self, msg: Message) {
        match msg.kind() {
            MessageKind::Response => self.deliver_response(msg).await,
            MessageKind::Request => self.handle_request(msg).await,
            MessageKind::Event => {}
        }
    }

    async fn on_heartbeat(&self) {
        self.peers.advance_epoch();
        self.overlay.retire_idle_parents();
        if self.is_root() {
            return;
        }
        if let Some(self_identity) = self.overlay.active_parent_identity() {
            if self.peers.self_idle(&self_identity) > 0 {
                let _ = self.call("broker.ping", Value::Object(serde_json::Map::new())).await;
            }
        }
    }

    /// Root-propagation and other tree-broadcast events reaching this rank's
    /// subscription (spec.md §4.5 "Root propagation").
    async fn handle_inbound_event(&self, event: Message) {
        if let Some(rest) = event.matches_prefix("event.kvs.setroot.") {
            if let Ok(root) = rest.parse::<RootRef>() {
                if let Some(kvs) = self.kvs.get() {
                    kvs.adopt_root(root).await;
                }
            }
        }
        let _ = self.snoop_tx.send(event);
    }

    async fn handle_request(&self, msg: Message) {
        self.metrics.record_message_routed();
        self.snoop(&msg);
        let service = match msg.service() {
            Ok(s) => s.to_string(),
            Err(e) => {
                self.respond_with_error(&msg, e).await;
                return;
            }
        };
        let outcome: Option<Result<Value>> = match service.as_str() {
            "broker" => self.handle_broker_op(&msg).await,
            "kvs" => Some(self.handle_kvs_op(&msg).await),
            _ => self.dispatch_to_module_or_parent(&msg, &service).await,
        };
        match outcome {
            Some(Ok(payload)) => {
                let response = msg.respond(msg.topic().clone(), Some(payload));
                self.deliver_response(response).await;
            }
            Some(Err(e)) => self.respond_with_error(&msg, e).await,
            None => {}
        }
    }

    async fn dispatch_to_module_or_parent(&self, msg: &Message, service: &str) -> Option<Result<Value>> {
        if let Some(module_identity) = self.modules.identity_for(service) {
            if msg.peek_identity() == Some(&module_identity) {
                return Some(Err(BrokerError::ServiceUnavailable(format!(
                    "loop detected delivering to module {service}"
                ))));
            }
            return match self.modules.deliver(service, msg.clone()) {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            };
        }
        if !self.is_root() {
            return match self.overlay.send(&EndpointRef::Parent, msg.clone()) {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            };
        }
        Some(Err(BrokerError::ServiceUnavailable(format!(
            "no handler for service {service}"
        ))))
    }

    async fn handle_broker_op(&self, msg: &Message) -> Option<Result<Value>> {
        let op = msg.topic().as_ref().strip_prefix("broker.").unwrap_or("");
        match op {
            "ping" => {
                if let Some(id) = msg.peek_identity() {
                    self.peers.touch(id);
                }
                Some(Ok(Value::Object(serde_json::Map::new())))
            }
            "rank_forward" => self.handle_rank_forward(msg).await,
            "publish" => Some(self.handle_publish(msg).await),
            "getattr" => Some(self.handle_getattr(msg)),
            other => Some(Err(BrokerError::ServiceUnavailable(format!(
                "unknown broker operation {other}"
            )))),
        }
    }

    async fn handle_rank_forward(&self, msg: &Message) -> Option<Result<Value>> {
        let payload = msg.payload().cloned().unwrap_or(Value::Null);
        let target_rank = match payload.get("target_rank").and_then(Value::as_u64) {
            Some(r) => r as u32,
            None => {
                return Some(Err(BrokerError::InvalidArgument(
                    "rank_forward missing target_rank".to_string(),
                )))
            }
        };
        if target_rank == self.config.rank.into_inner() {
            return Some(self.handle_rank_forward_target(&payload).await);
        }
        if let Some(right_id) = self.overlay.right_identity() {
            if msg.routing_stack_contains(&right_id) {
                return Some(Err(BrokerError::HostUnreachable(
                    "rank_forward loop detected on right-sibling chain".to_string(),
                )));
            }
        }
        match self.overlay.send(&EndpointRef::Right, msg.clone()) {
            Ok(()) => None,
            Err(e) => Some(Err(e)),
        }
    }

    async fn handle_rank_forward_target(&self, payload: &Value) -> Result<Value> {
        let inner_topic = payload
            .get("inner_topic")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::InvalidArgument("rank_forward missing inner_topic".to_string()))?;
        let topic = Topic::try_new(inner_topic).map_err(|e| BrokerError::ProtocolError(e.to_string()))?;
        let inner_payload = payload.get("inner_payload").cloned();
        let inner_request = Message::request(topic.clone(), inner_payload);
        let inner_service = topic.service().unwrap_or_default().to_string();
        match inner_service.as_str() {
            "kvs" => self.handle_kvs_op(&inner_request).await,
            other => Err(BrokerError::ServiceUnavailable(format!(
                "rank_forward has no local handler for service {other}"
            ))),
        }
    }

    async fn handle_publish(&self, msg: &Message) -> Result<Value> {
        let payload = msg.payload().cloned().unwrap_or(Value::Null);
        let topic_str = payload
            .get("topic")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::InvalidArgument("publish missing topic".to_string()))?;
        let topic = Topic::try_new(format!("event.{topic_str}"))
            .map_err(|e| BrokerError::ProtocolError(e.to_string()))?;
        let event_payload = payload.get("payload").cloned();

        if !self.is_root() {
            return self.call("broker.publish", payload.clone()).await;
        }
        let event = Message::event(topic, event_payload);
        self.overlay.publish_event(event.clone())?;
        self.handle_inbound_event(event).await;
        Ok(Value::Object(serde_json::Map::new()))
    }

    fn handle_getattr(&self, msg: &Message) -> Result<Value> {
        let payload = msg.payload().cloned().unwrap_or(Value::Null);
        let attr = payload
            .as_str()
            .map(str::to_string)
            .or_else(|| payload.get("attr").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| BrokerError::InvalidArgument("getattr missing attribute name".to_string()))?;
        match attr.as_str() {
            "broker.snoop-uri" => Ok(Value::String(self.snoop_uri.clone())),
            "broker.rank" => Ok(Value::from(self.config.rank.into_inner())),
            "broker.size" => Ok(Value::from(self.config.size.into_inner())),
            other => Err(BrokerError::NotFound(format!("unknown attribute {other}"))),
        }
    }

    async fn handle_kvs_op(&self, msg: &Message) -> Result<Value> {
        let op = msg
            .topic()
            .as_ref()
            .strip_prefix("kvs.")
            .ok_or_else(|| BrokerError::ProtocolError("malformed kvs topic".to_string()))?;
        let payload = msg.payload().cloned().unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let obj = payload.as_object().cloned().unwrap_or_default();
        match op {
            "get" => self.kvs().get(obj.keys().cloned().collect()).await,
            "put" => {
                let entries = obj
                    .into_iter()
                    .map(|(k, v)| (k, if v.is_null() { None } else { Some(v) }))
                    .collect();
                self.kvs().put(entries).await
            }
            "flush" => {
                self.kvs().flush().await?;
                Ok(Value::Object(serde_json::Map::new()))
            }
            "commit" => {
                let name = obj
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BrokerError::InvalidArgument("commit missing name".to_string()))?;
                let name = CommitName::try_new(name.to_string())
                    .map_err(|e| BrokerError::InvalidArgument(e.to_string()))?;
                self.kvs().commit(name).await
            }
            "getroot" => Ok(Value::String(self.kvs().getroot().await)),
            "dropcache" => {
                self.kvs().dropcache().await?;
                Ok(Value::Object(serde_json::Map::new()))
            }
            "load" => {
                let refs = obj
                    .keys()
                    .map(|k| Reference::try_new(k.clone()).map_err(|e| BrokerError::InvalidArgument(e.to_string())))
                    .collect::<Result<Vec<_>>>()?;
                self.kvs().handle_load(refs).await
            }
            "store" => {
                let entries = obj
                    .into_iter()
                    .map(|(k, v)| {
                        Reference::try_new(k)
                            .map(|r| (r, v))
                            .map_err(|e| BrokerError::InvalidArgument(e.to_string()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.kvs().handle_store(entries).await
            }
            "name" => {
                let entries = obj
                    .into_iter()
                    .map(|(k, v)| {
                        let r = match v {
                            Value::Null => None,
                            Value::String(s) => Some(
                                Reference::try_new(s).map_err(|e| BrokerError::InvalidArgument(e.to_string()))?,
                            ),
                            _ => {
                                return Err(BrokerError::InvalidArgument(
                                    "name value must be a string reference or null".to_string(),
                                ))
                            }
                        };
                        Ok((k, r))
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.kvs().handle_name(entries).await
            }
            other => Err(BrokerError::ServiceUnavailable(format!("unknown kvs operation {other}"))),
        }
    }

    async fn respond_with_error(&self, msg: &Message, err: BrokerError) {
        tracing::debug!(error = %err, topic = %msg.topic(), "request failed");
        self.deliver_response(msg.error_response(&err)).await;
    }

    /// Routes a `Response` toward wherever its top routing-stack identity
    /// addresses: a locally-originated call's `corr:<id>` marker, a local
    /// module, or a link toward a child/grandchild rank.
    async fn deliver_response(&self, mut msg: Message) {
        self.snoop(&msg);
        match msg.pop_identity() {
            None => {
                tracing::debug!(topic = %msg.topic(), "response reached its local origin");
            }
            Some(id) => {
                if let Some(corr) = id.as_ref().strip_prefix("corr:") {
                    self.resolve_inflight(corr, msg).await;
                } else if let Some(name) = self.modules.name_for(&id) {
                    if let Err(e) = self.modules.deliver(&name, msg) {
                        tracing::warn!(%e, "failed delivering response to local module");
                    }
                } else if let Err(e) = self.overlay.send(&EndpointRef::Child(id), msg) {
                    tracing::warn!(%e, "failed forwarding response toward child");
                }
            }
        }
    }

    async fn resolve_inflight(&self, corr: &str, msg: Message) {
        let Ok(corr_id) = corr.parse::<u64>() else {
            tracing::warn!(corr, "malformed correlation identity on response");
            return;
        };
        let sender = self.inflight.lock().await.remove(&corr_id);
        self.overlay.note_parent_reply_drained();
        if let Some(tx) = sender {
            let _ = tx.send(msg);
        }
    }
}

#[async_trait]
impl UpstreamCaller for Router {
    async fn call(&self, topic: &str, payload: Value) -> Result<Value> {
        let corr = self.next_corr.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inflight.lock().await.insert(corr, tx);

        let topic = Topic::try_new(topic).map_err(|e| BrokerError::ProtocolError(e.to_string()))?;
        let mut msg = Message::request(topic, Some(payload));
        msg.push_identity(
            Identity::try_new(format!("corr:{corr}")).expect("a numeric correlation id is always valid"),
        );
        if let Err(e) = self.overlay.send(&EndpointRef::Parent, msg) {
            self.inflight.lock().await.remove(&corr);
            return Err(e);
        }

        let reply = rx
            .await
            .map_err(|_| BrokerError::Cancelled("upstream call cancelled".to_string()))?;
        match reply.payload() {
            Some(Value::Object(obj)) if obj.contains_key("error") => {
                let kind = obj.get("error").and_then(Value::as_str).unwrap_or("ProtocolError");
                let message = obj.get("message").and_then(Value::as_str).unwrap_or_default();
                Err(BrokerError::from_kind(kind, message.to_string()))
            }
            other => Ok(other.cloned().unwrap_or(Value::Null)),
        }
    }
}
