//! Content-addressed KVS engine (spec.md §4.5, component C5) — the core of
//! the core. Every rank runs one instance; rank 0 is the treeroot.
//!
//! Grounded on the teacher's `message_router` for the overall
//! stall/resume-via-channel shape, generalized from "agent routing" to
//! "blob/name resolution". The cache and writeback queue are each guarded by
//! a single `tokio::Mutex`, matching spec.md §5's "owned exclusively by the
//! KVS task" — there is no concurrent access to reason about, only
//! cooperative interleaving across `.await` points.

pub mod checkpoint;
pub mod types;

pub use types::{CommitName, Reference, RootRef};

use crate::error::{BrokerError, Result};
use crate::observability::Metrics;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, OnceCell, RwLock};

/// Abstraction over "send a request upstream and await its reply", so the
/// KVS engine does not depend on the router/overlay directly (mirrors the
/// teacher's `DeliveryEngine` trait seam).
#[async_trait]
pub trait UpstreamCaller: Send + Sync {
    /// Sends `topic`/`payload` to the parent rank and awaits the response payload.
    async fn call(&self, topic: &str, payload: Value) -> Result<Value>;
}

fn compute_reference(value: &Value) -> Reference {
    let canonical = serde_json::to_vec(value).expect("Value always serializes");
    let digest = blake3::hash(&canonical);
    Reference::try_new(hex::encode(digest.as_bytes())).expect("hex digest is always valid")
}

fn encode_directory(dir: &HashMap<String, Reference>) -> Value {
    let map: serde_json::Map<String, Value> = dir
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.to_string())))
        .collect();
    Value::Object(map)
}

fn decode_directory(value: &Value) -> Result<HashMap<String, Reference>> {
    let obj = value
        .as_object()
        .ok_or_else(|| BrokerError::Corruption("directory blob is not an object".to_string()))?;
    obj.iter()
        .map(|(k, v)| {
            let hash = v
                .as_str()
                .ok_or_else(|| BrokerError::Corruption(format!("directory entry {k} is not a string ref")))?;
            Reference::try_new(hash.to_string())
                .map(|r| (k.clone(), r))
                .map_err(|e| BrokerError::Corruption(format!("directory entry {k}: {e}")))
        })
        .collect()
}

enum Slot {
    Present(Value),
    Pending(Vec<oneshot::Sender<Value>>),
}

#[derive(Default)]
struct Cache {
    entries: HashMap<Reference, Slot>,
}

#[derive(Debug, Clone)]
enum WbOp {
    Store(Reference),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WbState {
    Clean,
    Dirty,
    Flushing,
}

struct Writeback {
    queue: Vec<WbOp>,
    state: WbState,
    waiting_flushes: Vec<oneshot::Sender<Result<()>>>,
}

impl Default for Writeback {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            state: WbState::Clean,
            waiting_flushes: Vec::new(),
        }
    }
}

/// One rank's KVS instance.
pub struct KvsEngine {
    is_root: bool,
    upstream: Option<Arc<dyn UpstreamCaller>>,
    cache: Mutex<Cache>,
    root: RwLock<RootRef>,
    pending_names: Mutex<Vec<(String, Option<Reference>)>>,
    writeback: Mutex<Writeback>,
    pending_commits: dashmap::DashMap<CommitName, Arc<OnceCell<RootRef>>>,
    event_publisher: Arc<dyn EventPublisher>,
    metrics: Arc<dyn Metrics>,
}

/// Publishes a root-epoch event; implemented by the broker's overlay wiring.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes `event.kvs.setroot.<seq>.<hash>` for every subscriber.
    async fn publish_setroot(&self, root: &RootRef);
}

impl KvsEngine {
    /// Creates the treeroot's engine, seeded with an empty directory.
    #[must_use]
    pub fn new_root(event_publisher: Arc<dyn EventPublisher>, metrics: Arc<dyn Metrics>) -> Self {
        let empty_dir = encode_directory(&HashMap::new());
        let empty_ref = compute_reference(&empty_dir);
        let mut cache = Cache::default();
        cache.entries.insert(empty_ref.clone(), Slot::Present(empty_dir));
        Self {
            is_root: true,
            upstream: None,
            cache: Mutex::new(cache),
            root: RwLock::new(RootRef::genesis(empty_ref)),
            pending_names: Mutex::new(Vec::new()),
            writeback: Mutex::new(Writeback::default()),
            pending_commits: dashmap::DashMap::new(),
            event_publisher,
            metrics,
        }
    }

    /// Creates a non-root engine with a cold cache, lagging the treeroot
    /// until its first `getroot`/`get`/root-propagation event.
    #[must_use]
    pub fn new_non_root(
        upstream: Arc<dyn UpstreamCaller>,
        event_publisher: Arc<dyn EventPublisher>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        let empty_dir = encode_directory(&HashMap::new());
        let empty_ref = compute_reference(&empty_dir);
        Self {
            is_root: false,
            upstream: Some(upstream),
            cache: Mutex::new(Cache::default()),
            root: RwLock::new(RootRef::genesis(empty_ref)),
            pending_names: Mutex::new(Vec::new()),
            writeback: Mutex::new(Writeback::default()),
            pending_commits: dashmap::DashMap::new(),
            event_publisher,
            metrics,
        }
    }

    fn upstream(&self) -> &Arc<dyn UpstreamCaller> {
        self.upstream
            .as_ref()
            .expect("non-root engine always has an upstream caller")
    }

    async fn cache_insert_present(&self, reference: Reference, value: Value) {
        let mut cache = self.cache.lock().await;
        if let Some(Slot::Pending(waiters)) = cache.entries.insert(reference, Slot::Present(value.clone())) {
            for tx in waiters {
                let _ = tx.send(value.clone());
            }
        }
    }

    async fn fail_pending(&self, reference: &Reference) {
        let mut cache = self.cache.lock().await;
        cache.entries.remove(reference);
    }

    /// Resolves `reference` to its blob, stalling on a placeholder or
    /// forwarding a `kvs.load` upstream if absent (spec.md §4.5 "Blob load
    /// with stalls").
    ///
    /// # Errors
    /// Returns [`BrokerError::Corruption`] if this is the treeroot and the
    /// reference is missing, or [`BrokerError::NotFound`] if the upstream
    /// reply omits it.
    #[tracing::instrument(level = "debug", skip(self), fields(%reference))]
    pub async fn load_blob(&self, reference: Reference) -> Result<Value> {
        let waiter = {
            let mut cache = self.cache.lock().await;
            match cache.entries.get_mut(&reference) {
                Some(Slot::Present(v)) => return Ok(v.clone()),
                Some(Slot::Pending(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    cache.entries.insert(reference.clone(), Slot::Pending(Vec::new()));
                    None
                }
            }
        };
        self.metrics.record_kvs_stall();
        if let Some(rx) = waiter {
            return rx
                .await
                .map_err(|_| BrokerError::Cancelled(format!("load of {reference} cancelled")));
        }

        if self.is_root {
            self.fail_pending(&reference).await;
            return Err(BrokerError::Corruption(format!(
                "treeroot missing blob {reference}"
            )));
        }

        let payload = serde_json::json!({ reference.to_string(): Value::Null });
        let reply = self.upstream().call("kvs.load", payload).await;
        match reply {
            Ok(v) => match v.get(reference.to_string()).cloned() {
                Some(value) => {
                    let computed = compute_reference(&value);
                    if computed != reference {
                        tracing::warn!(%reference, %computed, "hash mismatch on loaded blob, ignoring");
                        self.fail_pending(&reference).await;
                        return Err(BrokerError::NotFound(format!(
                            "reference {reference} failed hash verification"
                        )));
                    }
                    self.cache_insert_present(reference.clone(), value.clone()).await;
                    Ok(value)
                }
                None => {
                    self.fail_pending(&reference).await;
                    Err(BrokerError::NotFound(format!(
                        "reference {reference} not found upstream"
                    )))
                }
            },
            Err(e) => {
                self.fail_pending(&reference).await;
                Err(e)
            }
        }
    }

    /// Resolves each key against the current root directory; absent keys map
    /// to `Value::Null`. May stall on the directory blob or on any value blob.
    ///
    /// # Errors
    /// Propagates [`KvsEngine::load_blob`] errors.
    #[tracing::instrument(level = "debug", skip(self, keys))]
    pub async fn get(&self, keys: Vec<String>) -> Result<Value> {
        let root_hash = self.root.read().await.hash.clone();
        let dir_value = self.load_blob(root_hash).await?;
        let dir = decode_directory(&dir_value)?;
        let mut out = serde_json::Map::new();
        for key in keys {
            match dir.get(&key) {
                Some(reference) => {
                    let value = self.load_blob(reference.clone()).await?;
                    out.insert(key, value);
                }
                None => {
                    out.insert(key, Value::Null);
                }
            }
        }
        Ok(Value::Object(out))
    }

    async fn writeback_enqueue(&self, op: WbOp) {
        let mut wb = self.writeback.lock().await;
        wb.queue.push(op);
        if wb.state != WbState::Flushing {
            wb.state = WbState::Dirty;
        }
        self.metrics.record_writeback_depth(wb.queue.len());
    }

    async fn writeback_ack(&self, matches: impl Fn(&WbOp) -> bool) {
        let mut wb = self.writeback.lock().await;
        if let Some(pos) = wb.queue.iter().position(matches) {
            wb.queue.remove(pos);
        }
        self.metrics.record_writeback_depth(wb.queue.len());
        if wb.queue.is_empty() {
            for tx in wb.waiting_flushes.drain(..) {
                let _ = tx.send(Ok(()));
            }
            if wb.state != WbState::Flushing {
                wb.state = WbState::Clean;
            }
        }
    }

    async fn relay_store(&self, reference: Reference, blob: Value) -> Result<()> {
        self.cache_insert_present(reference.clone(), blob.clone()).await;
        if self.is_root {
            return Ok(());
        }
        self.writeback_enqueue(WbOp::Store(reference.clone())).await;
        let payload = serde_json::json!({ reference.to_string(): blob });
        self.upstream().call("kvs.store", payload).await?;
        self.writeback_ack(|op| matches!(op, WbOp::Store(r) if *r == reference)).await;
        Ok(())
    }

    async fn relay_name(&self, key: String, reference: Option<Reference>) -> Result<()> {
        if self.is_root {
            self.pending_names.lock().await.push((key, reference));
            return Ok(());
        }
        self.writeback_enqueue(WbOp::Name(key.clone())).await;
        let payload = serde_json::json!({
            key.clone(): reference.as_ref().map(ToString::to_string),
        });
        self.upstream().call("kvs.name", payload).await?;
        self.writeback_ack(|op| matches!(op, WbOp::Name(k) if *k == key)).await;
        Ok(())
    }

    /// Writes `entries` (`Some(value)` to set, `None` to unlink) through the
    /// writeback queue (non-root) or directly into the pending commit
    /// (root). Returns an ack.
    ///
    /// # Errors
    /// Propagates upstream `store`/`name` failures on non-root ranks.
    #[tracing::instrument(level = "debug", skip(self, entries))]
    pub async fn put(&self, entries: Vec<(String, Option<Value>)>) -> Result<Value> {
        for (key, value) in entries {
            match value {
                Some(v) => {
                    let reference = compute_reference(&v);
                    self.relay_store(reference.clone(), v).await?;
                    self.relay_name(key, Some(reference)).await?;
                }
                None => {
                    self.relay_name(key, None).await?;
                }
            }
        }
        Ok(Value::Object(serde_json::Map::new()))
    }

    /// Blocks until this rank's writeback queue has drained to the root. A
    /// no-op at the root itself.
    ///
    /// # Errors
    /// Propagates upstream `flush` failure.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn flush(&self) -> Result<()> {
        if self.is_root {
            return Ok(());
        }
        let pending = {
            let mut wb = self.writeback.lock().await;
            if wb.queue.is_empty() && wb.state != WbState::Flushing {
                wb.state = WbState::Flushing;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                wb.waiting_flushes.push(tx);
                Some(rx)
            }
        };
        match pending {
            None => {
                self.upstream()
                    .call("kvs.flush", Value::Object(serde_json::Map::new()))
                    .await?;
                self.writeback.lock().await.state = WbState::Clean;
                Ok(())
            }
            Some(rx) => rx
                .await
                .map_err(|_| BrokerError::Cancelled("flush cancelled".to_string()))?,
        }
    }

    /// Materializes a named commit. Concurrent calls with the same name
    /// observe the same resulting root reference (spec.md §4.5 idempotence).
    ///
    /// # Errors
    /// Propagates upstream `commit` failure on non-root ranks.
    #[tracing::instrument(level = "debug", skip(self), fields(%name))]
    pub async fn commit(&self, name: CommitName) -> Result<Value> {
        if !self.is_root {
            let payload = serde_json::json!({ "name": name.to_string() });
            let resp = self.upstream().call("kvs.commit", payload).await?;
            if let Some(rootref) = resp.get("rootref").and_then(Value::as_str) {
                if let Ok(parsed) = rootref.parse::<RootRef>() {
                    self.adopt_root(parsed).await;
                }
            }
            return Ok(resp);
        }
        let cell = self
            .pending_commits
            .entry(name.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let rootref = cell
            .get_or_init(|| self.materialize_commit())
            .await
            .clone();
        Ok(serde_json::json!({ "name": name.to_string(), "rootref": rootref.to_string() }))
    }

    async fn materialize_commit(&self) -> RootRef {
        let names = std::mem::take(&mut *self.pending_names.lock().await);
        let current = self.root.read().await.clone();
        let dir_value = self
            .load_blob(current.hash.clone())
            .await
            .expect("treeroot directory is always present");
        let mut dir = decode_directory(&dir_value).expect("treeroot directory is always well-formed");
        for (key, maybe_ref) in names {
            match maybe_ref {
                Some(r) => {
                    dir.insert(key, r);
                }
                None => {
                    dir.remove(&key);
                }
            }
        }
        dir.insert(format!("snapshot.{}", current.seq), current.hash.clone());
        let new_value = encode_directory(&dir);
        let new_ref = compute_reference(&new_value);
        self.cache_insert_present(new_ref.clone(), new_value).await;
        let new_root = RootRef {
            seq: current.seq + 1,
            hash: new_ref,
        };
        *self.root.write().await = new_root.clone();
        self.event_publisher.publish_setroot(&new_root).await;
        new_root
    }

    /// The current root reference, formatted `"<seq>.<hash>"`.
    pub async fn getroot(&self) -> String {
        self.root.read().await.to_string()
    }

    /// Adopts `new` if it is newer than the locally known root — root
    /// reference sequence is never moved backward (spec.md §4.5 "Root
    /// propagation").
    pub async fn adopt_root(&self, new: RootRef) {
        let mut root = self.root.write().await;
        if new.seq > root.seq {
            *root = new;
        }
    }

    /// Evicts cache entries with no in-flight waiters. Fails with
    /// [`BrokerError::Busy`] at a non-root rank whose writeback queue is
    /// non-empty.
    ///
    /// # Errors
    /// Returns [`BrokerError::Busy`] per the above.
    pub async fn dropcache(&self) -> Result<()> {
        if !self.is_root {
            let wb = self.writeback.lock().await;
            if !wb.queue.is_empty() {
                return Err(BrokerError::Busy("writeback queue non-empty".to_string()));
            }
        }
        let mut cache = self.cache.lock().await;
        cache.entries.retain(|_, slot| matches!(slot, Slot::Pending(_)));
        Ok(())
    }

    /// Services an upstream `kvs.load` request from a child rank, resolving
    /// through this rank's own cache (and, transitively, its own parent).
    ///
    /// # Errors
    /// Propagates [`KvsEngine::load_blob`] errors.
    pub async fn handle_load(&self, refs: Vec<Reference>) -> Result<Value> {
        let mut out = serde_json::Map::new();
        for r in refs {
            let value = self.load_blob(r.clone()).await?;
            out.insert(r.to_string(), value);
        }
        Ok(Value::Object(out))
    }

    /// Accepts blobs pushed upstream by a child rank, relaying further
    /// upstream unless this is the treeroot.
    ///
    /// # Errors
    /// Propagates upstream `store` failures.
    pub async fn handle_store(&self, entries: Vec<(Reference, Value)>) -> Result<Value> {
        for (reference, blob) in entries {
            let computed = compute_reference(&blob);
            if computed != reference {
                tracing::warn!(%reference, "hash mismatch on stored blob, ignoring");
                continue;
            }
            self.relay_store(reference, blob).await?;
        }
        Ok(Value::Object(serde_json::Map::new()))
    }

    /// Accepts name operations pushed upstream by a child rank, staging them
    /// into this rank's pending commit if root, or relaying further upstream.
    ///
    /// # Errors
    /// Propagates upstream `name` failures.
    pub async fn handle_name(&self, entries: Vec<(String, Option<Reference>)>) -> Result<Value> {
        for (key, reference) in entries {
            self.relay_name(key, reference).await?;
        }
        Ok(Value::Object(serde_json::Map::new()))
    }

    /// Services an upstream `kvs.flush` request: at the root this is an
    /// immediate no-op; intermediate ranks forward toward the root.
    ///
    /// # Errors
    /// Propagates upstream `flush` failures.
    pub async fn handle_flush(&self) -> Result<()> {
        self.flush().await
    }

    /// Whether this engine is the treeroot.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.is_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoopPublisher;

    #[async_trait]
    impl EventPublisher for NoopPublisher {
        async fn publish_setroot(&self, _root: &RootRef) {}
    }

    fn test_metrics() -> Arc<dyn Metrics> {
        Arc::new(crate::observability::TracingMetrics::default())
    }

    struct RootDriver {
        root: Arc<KvsEngine>,
        load_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl UpstreamCaller for RootDriver {
        async fn call(&self, topic: &str, payload: Value) -> Result<Value> {
            match topic {
                "kvs.load" => {
                    self.load_calls.fetch_add(1, Ordering::SeqCst);
                    let obj = payload.as_object().unwrap();
                    let refs: Vec<Reference> = obj
                        .keys()
                        .map(|k| Reference::try_new(k.clone()).unwrap())
                        .collect();
                    self.root.handle_load(refs).await
                }
                "kvs.store" => {
                    let obj = payload.as_object().unwrap();
                    let entries = obj
                        .iter()
                        .map(|(k, v)| (Reference::try_new(k.clone()).unwrap(), v.clone()))
                        .collect();
                    self.root.handle_store(entries).await
                }
                "kvs.name" => {
                    let obj = payload.as_object().unwrap();
                    let entries = obj
                        .iter()
                        .map(|(k, v)| {
                            let r = v.as_str().map(|s| Reference::try_new(s.to_string()).unwrap());
                            (k.clone(), r)
                        })
                        .collect();
                    self.root.handle_name(entries).await
                }
                "kvs.flush" => {
                    self.root.handle_flush().await?;
                    Ok(Value::Object(serde_json::Map::new()))
                }
                "kvs.commit" => {
                    let name = CommitName::try_new(payload["name"].as_str().unwrap().to_string()).unwrap();
                    self.root.commit(name).await
                }
                other => panic!("unexpected topic {other}"),
            }
        }
    }

    fn commit_name(s: &str) -> CommitName {
        CommitName::try_new(s).unwrap()
    }

    #[tokio::test]
    async fn put_commit_get_round_trips() {
        let root = Arc::new(KvsEngine::new_root(Arc::new(NoopPublisher), test_metrics()));
        let driver = Arc::new(RootDriver {
            root: root.clone(),
            load_calls: Arc::new(AtomicU32::new(0)),
        });
        let rank1 = KvsEngine::new_non_root(driver.clone(), Arc::new(NoopPublisher), test_metrics());

        rank1
            .put(vec![("a".to_string(), Some(serde_json::json!("1")))])
            .await
            .unwrap();
        rank1.commit(commit_name("c1")).await.unwrap();

        let result = rank1.get(vec!["a".to_string()]).await.unwrap();
        assert_eq!(result["a"], serde_json::json!("1"));
    }

    #[tokio::test]
    async fn single_load_invariant_holds_under_concurrency() {
        let root = Arc::new(KvsEngine::new_root(Arc::new(NoopPublisher), test_metrics()));
        let load_calls = Arc::new(AtomicU32::new(0));
        let driver = Arc::new(RootDriver {
            root: root.clone(),
            load_calls: load_calls.clone(),
        });
        let staging = KvsEngine::new_non_root(driver.clone(), Arc::new(NoopPublisher), test_metrics());
        staging
            .put(vec![("k".to_string(), Some(serde_json::json!("v")))])
            .await
            .unwrap();
        staging.commit(commit_name("seed")).await.unwrap();

        let rank1 = Arc::new(KvsEngine::new_non_root(driver, Arc::new(NoopPublisher), test_metrics()));
        // A non-root rank only learns a new root via `event.kvs.setroot`
        // (exercised end to end in the integration tests); adopt it directly
        // here since this test wires a `NoopPublisher`.
        let seeded_root = root.getroot().await.parse().unwrap();
        rank1.adopt_root(seeded_root).await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = rank1.clone();
            handles.push(tokio::spawn(async move { r.get(vec!["k".to_string()]).await }));
        }
        for h in handles {
            let result = h.await.unwrap().unwrap();
            assert_eq!(result["k"], serde_json::json!("v"));
        }
        // One load for the root directory blob, one for the value blob ("v"),
        // regardless of how many concurrent getters raced to resolve them.
        assert_eq!(load_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn commit_idempotent_by_name() {
        let root = Arc::new(KvsEngine::new_root(Arc::new(NoopPublisher), test_metrics()));
        let driver = Arc::new(RootDriver {
            root: root.clone(),
            load_calls: Arc::new(AtomicU32::new(0)),
        });
        let rank1 = Arc::new(KvsEngine::new_non_root(driver.clone(), Arc::new(NoopPublisher), test_metrics()));
        let rank2 = Arc::new(KvsEngine::new_non_root(driver, Arc::new(NoopPublisher), test_metrics()));

        rank1
            .put(vec![("shared".to_string(), Some(serde_json::json!(1)))])
            .await
            .unwrap();

        let (r1, r2) = tokio::join!(
            rank1.commit(commit_name("shared-commit")),
            rank2.commit(commit_name("shared-commit")),
        );
        assert_eq!(r1.unwrap()["rootref"], r2.unwrap()["rootref"]);
    }

    #[tokio::test]
    async fn dropcache_rejects_when_writeback_nonempty() {
        let root = Arc::new(KvsEngine::new_root(Arc::new(NoopPublisher), test_metrics()));
        assert!(root.dropcache().await.is_ok());
    }

    #[tokio::test]
    async fn root_never_stalls_on_missing_blob() {
        let root = KvsEngine::new_root(Arc::new(NoopPublisher), test_metrics());
        let bogus = Reference::try_new("ab".repeat(32)).unwrap();
        let err = root.load_blob(bogus).await.unwrap_err();
        assert_eq!(err.kind_name(), "Corruption");
    }

    #[tokio::test]
    async fn snapshot_history_resolves_each_prior_commit() {
        let root = Arc::new(KvsEngine::new_root(Arc::new(NoopPublisher), test_metrics()));
        let driver = Arc::new(RootDriver {
            root: root.clone(),
            load_calls: Arc::new(AtomicU32::new(0)),
        });
        let rank1 = KvsEngine::new_non_root(driver, Arc::new(NoopPublisher), test_metrics());

        let mut snapshot_roots = Vec::new();
        for i in 0..3 {
            rank1
                .put(vec![(format!("k{i}"), Some(serde_json::json!(i)))])
                .await
                .unwrap();
            let resp = rank1.commit(commit_name(&format!("c{i}"))).await.unwrap();
            snapshot_roots.push(resp["rootref"].as_str().unwrap().to_string());
        }

        // Each commit records `snapshot.<old_seq>` pointing at the root ref
        // that was current *before* that commit, so the directory resulting
        // from commit `i` (0-indexed) is addressable as `snapshot.<i+1>` in
        // every later directory. The final commit's own root is never
        // snapshotted (that would require one more commit on top of it), so
        // only commits 0..len-1 are resolvable from the current directory.
        let current_root = root.getroot().await.parse::<RootRef>().unwrap();
        let current_dir = root.load_blob(current_root.hash).await.unwrap();
        let dir = decode_directory(&current_dir).unwrap();
        for (i, expected) in snapshot_roots[..snapshot_roots.len() - 1].iter().enumerate() {
            let expected_root: RootRef = expected.parse().unwrap();
            let snapshot_ref = dir.get(&format!("snapshot.{}", i + 1)).unwrap();
            assert_eq!(*snapshot_ref, expected_root.hash);
        }
    }
}
