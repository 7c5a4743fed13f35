//! In-process service modules (spec.md §4.4, component C4): each module runs
//! on its own cooperative task with a single bidirectional channel to the
//! router, and carries a stable UUID identity used as the first routing
//! frame for any request it originates.

use crate::error::{BrokerError, Result};
use crate::message::{Identity, Message};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// The behavior a loaded module runs on its cooperative task. Implementors
/// receive their inbox (requests/events routed to them) and a handle to push
/// messages back to the router.
#[async_trait]
pub trait ModuleBehavior: Send + 'static {
    /// Drives the module until `inbox` is closed (the router signals
    /// unload by dropping the sender side).
    async fn run(
        self: Box<Self>,
        identity: Identity,
        args: HashMap<String, String>,
        inbox: mpsc::UnboundedReceiver<Message>,
        outbox: mpsc::UnboundedSender<Message>,
    );
}

struct LoadedModule {
    identity: Identity,
    to_module: mpsc::UnboundedSender<Message>,
    unload_waiters: Vec<oneshot::Sender<()>>,
}

/// Owns the module-by-name table and every module's cooperative task
/// (spec.md §5: "owned by the router task").
pub struct ModuleHost {
    modules: DashMap<String, LoadedModule>,
    by_identity: DashMap<Identity, String>,
    to_router: mpsc::UnboundedSender<Message>,
}

impl ModuleHost {
    /// Creates a host that delivers messages modules originate onto `to_router`.
    #[must_use]
    pub fn new(to_router: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            modules: DashMap::new(),
            by_identity: DashMap::new(),
            to_router,
        }
    }

    /// Loads `name`, spawning `behavior` on its own cooperative task.
    ///
    /// # Errors
    /// Returns [`BrokerError::AlreadyExists`] if `name` is already loaded.
    pub fn load(
        &self,
        name: &str,
        behavior: Box<dyn ModuleBehavior>,
        args: HashMap<String, String>,
    ) -> Result<Identity> {
        if self.modules.contains_key(name) {
            return Err(BrokerError::AlreadyExists(format!("module already loaded: {name}")));
        }
        let identity = Identity::try_new(Uuid::new_v4().to_string())
            .expect("a freshly generated UUID is always a valid identity");
        let (to_module, inbox) = mpsc::unbounded_channel();
        let outbox = self.to_router.clone();
        let task_identity = identity.clone();
        tokio::spawn(async move {
            behavior.run(task_identity, args, inbox, outbox).await;
        });
        self.modules.insert(
            name.to_string(),
            LoadedModule {
                identity: identity.clone(),
                to_module,
                unload_waiters: Vec::new(),
            },
        );
        self.by_identity.insert(identity.clone(), name.to_string());
        Ok(identity)
    }

    /// Requests that `name` unload. The reply is deferred until the module's
    /// task finishes draining (signaled by closing its inbox here and the
    /// task's `run` returning); multiple concurrent unload requests for the
    /// same module all observe the same completion.
    ///
    /// # Errors
    /// Returns [`BrokerError::NotFound`] if `name` is not loaded.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let rx = {
            let mut entry = self
                .modules
                .get_mut(name)
                .ok_or_else(|| BrokerError::NotFound(format!("module not loaded: {name}")))?;
            let (tx, rx) = oneshot::channel();
            entry.unload_waiters.push(tx);
            rx
        };
        if let Some((_, module)) = self.modules.remove(name) {
            self.by_identity.remove(&module.identity);
            drop(module.to_module);
            for waiter in module.unload_waiters {
                let _ = waiter.send(());
            }
        }
        rx.await.map_err(|_| BrokerError::Cancelled(format!("unload of {name} cancelled")))
    }

    /// Whether `identity` is a currently loaded module's own identity.
    #[must_use]
    pub fn is_local(&self, identity: &Identity) -> bool {
        self.by_identity.contains_key(identity)
    }

    /// The identity a loaded module named `name` is addressed by, for loop
    /// guards against traffic that routed back to its own origin.
    #[must_use]
    pub fn identity_for(&self, name: &str) -> Option<Identity> {
        self.modules.get(name).map(|m| m.identity.clone())
    }

    /// The service name a local module identity is registered under.
    #[must_use]
    pub fn name_for(&self, identity: &Identity) -> Option<String> {
        self.by_identity.get(identity).map(|e| e.clone())
    }

    /// Delivers `msg` to the module named `name`.
    ///
    /// # Errors
    /// Returns [`BrokerError::ServiceUnavailable`] if `name` is not loaded.
    pub fn deliver(&self, name: &str, msg: Message) -> Result<()> {
        let module = self
            .modules
            .get(name)
            .ok_or_else(|| BrokerError::ServiceUnavailable(format!("module not loaded: {name}")))?;
        module
            .to_module
            .send(msg)
            .map_err(|e| BrokerError::TransportError(e.to_string()))
    }
}

/// A module that replies to every request with an empty ack and otherwise
/// ignores its inbox; used in tests and as a load-bearing placeholder for
/// modules whose real behavior is out of scope for the core (spec.md §1).
pub struct EchoModule;

#[async_trait]
impl ModuleBehavior for EchoModule {
    async fn run(
        self: Box<Self>,
        _identity: Identity,
        _args: HashMap<String, String>,
        mut inbox: mpsc::UnboundedReceiver<Message>,
        outbox: mpsc::UnboundedSender<Message>,
    ) {
        while let Some(msg) = inbox.recv().await {
            if msg.kind() == crate::message::MessageKind::Request {
                let reply = msg.respond(msg.topic().clone(), Some(serde_json::json!({})));
                let _ = outbox.send(reply);
            }
        }
    }
}
