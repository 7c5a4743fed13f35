//! Process-level wiring: binds one rank's overlay endpoints, installs its
//! router and KVS engine, loads configured modules, and drives the router's
//! event loop (SPEC_FULL.md §4.6 "Configuration & Bootstrap").
//!
//! Grounded on the teacher's `main.rs` bootstrap sequence (build config, init
//! logging, construct the runtime, run it) generalized from a single HTTP
//! server to a per-rank broker process.

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::module_host::EchoModule;
use crate::observability::{Metrics, TracingMetrics};
use crate::overlay::{EventRole, Overlay, OverlayRegistry};
use crate::router::Router;
use std::sync::Arc;

/// One rank's fully-wired broker: overlay endpoints bound/connected, router
/// and KVS engine installed, configured modules loaded.
pub struct BrokerNode {
    config: Arc<BrokerConfig>,
    overlay: Arc<Overlay>,
    router: Arc<Router>,
}

impl BrokerNode {
    /// Binds and connects this rank's overlay endpoints against `registry`
    /// (shared by every rank in the same broker session — see
    /// `DESIGN.md` for why cross-process transport is out of scope here),
    /// installs the router and KVS engine, and loads `config.modules`.
    ///
    /// # Errors
    /// Returns a [`crate::error::BrokerError`] if any endpoint fails to
    /// bind/connect, most commonly `TransportError` for an unresolvable
    /// `parent_uri`/`right_uri`, or if a non-root rank's parent has not yet
    /// bound its event endpoint.
    pub async fn start(config: BrokerConfig, registry: OverlayRegistry) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let overlay = Arc::new(Overlay::new(registry));

        overlay.bind_child(&config.child_uri).await?;

        let event_role = if let Some(parent_uri) = &config.parent_uri {
            overlay.connect_parent(parent_uri).await?;
            EventRole::NonRoot { parent_event_uri: config_parent_event_uri(&config) }
        } else {
            EventRole::Root
        };
        overlay.bind_or_connect_event(&config.event_uri, event_role)?;

        if let Some(right_uri) = &config.right_uri {
            overlay.connect_right(right_uri).await?;
        }

        let metrics: Arc<dyn Metrics> = Arc::new(TracingMetrics::default());
        let router = Router::new(config.clone(), overlay.clone(), metrics);
        router.install_kvs();

        for name in &config.modules {
            router.modules().load(name, Box::new(EchoModule), std::collections::HashMap::new())?;
        }

        std::fs::create_dir_all(&config.run_dir).ok();
        let pid_path = config.run_dir.join("broker.pid");
        let _ = std::fs::write(&pid_path, std::process::id().to_string());

        Ok(Arc::new(Self { config, overlay, router }))
    }

    /// Runs this rank's router loop until its channels close. Does not
    /// return during normal operation.
    pub async fn run(self: Arc<Self>) {
        self.router.clone().run().await;
    }

    /// This rank's resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<BrokerConfig> {
        &self.config
    }

    /// This rank's overlay, for tests that need to connect further ranks to it.
    #[must_use]
    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    /// This rank's router, for direct KVS/module access in-process (the
    /// local API socket that would normally front this is out of scope).
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}

/// The parent's event URI, by convention `<parent_uri>` with its `/child`
/// suffix replaced by `/event` (the bootstrap mechanism that would otherwise
/// hand ranks each other's resolved endpoints is out of scope, spec.md §1).
fn config_parent_event_uri(config: &BrokerConfig) -> String {
    config
        .parent_uri
        .as_ref()
        .map(|uri| uri.replace("/child", "/event"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterSize, Rank};

    fn rank_config(session: &str, rank: u32, size: u32, parent_uri: Option<String>) -> BrokerConfig {
        let mut cfg = BrokerConfig::development(session);
        cfg.rank = Rank::from(rank);
        cfg.size = ClusterSize::try_new(size).unwrap();
        cfg.parent_uri = parent_uri;
        cfg.child_uri = format!("inproc://{session}/rank-{rank}/child");
        cfg.event_uri = format!("inproc://{session}/rank-{rank}/event");
        cfg.run_dir = std::env::temp_dir().join(format!("{session}-{rank}"));
        cfg
    }

    #[tokio::test]
    async fn two_rank_session_wires_and_round_trips_kvs() {
        let registry = OverlayRegistry::new();
        let root = BrokerNode::start(rank_config("t-broker", 0, 2, None), registry.clone())
            .await
            .unwrap();
        let root_child_uri = root.overlay().child_uri().unwrap();

        let child = BrokerNode::start(
            rank_config("t-broker", 1, 2, Some(root_child_uri)),
            registry,
        )
        .await
        .unwrap();

        tokio::spawn(root.clone().run());
        tokio::spawn(child.clone().run());

        child
            .router()
            .kvs()
            .put(vec![("x".to_string(), Some(serde_json::json!(42)))])
            .await
            .unwrap();
        child
            .router()
            .kvs()
            .commit(crate::kvs::CommitName::try_new("c").unwrap())
            .await
            .unwrap();
        let got = child.router().kvs().get(vec!["x".to_string()]).await.unwrap();
        assert_eq!(got["x"], serde_json::json!(42));

        let pid_path = child.config().run_dir.join("broker.pid");
        assert!(pid_path.exists());
    }
}
