//! Per-component state with locked merges, the global projection and
//! snapshot persistence.
//!
//! Lock order when both maps are needed: `states`, then `global`.

pub mod lock;
pub mod merge;
pub mod model;
pub mod snapshot;

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub use lock::{KeyGuard, KeyedLocks};
pub use merge::deep_merge;
pub use model::{ComponentState, HistoryEntry, Projection, StateMetrics, StateQuery};
pub use snapshot::Snapshot;

use crate::bus::{Bus, BusEvent, BroadcastFilter, DeliveryMethod};
use crate::config::StateConfig;
use crate::contract::taxonomy::events;
use crate::contract::{is_valid_id, validate_state_against_schema, EnvelopeOptions, Payload, StateOp, StateSchema};
use crate::error::{CoreError, CoreResult};
use crate::logging::{
    log, log_persistence_error, log_snapshot, log_state_commit, obj, v_str, Domain, Level, ProfileScope,
};
use crate::now_ms;

/// Sender id on envelopes the store originates.
pub const STATE_STORE_ID: &str = "state-store";
/// Capability a component advertises to receive `state-changed` events.
pub const STATE_SUBSCRIBER: &str = "state-subscriber";

const TASK_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Refresh the component's global projection.
    pub global: bool,
    /// Broadcast `state-changed` to state subscribers.
    pub notify: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            global: true,
            notify: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub create_if_not_exists: bool,
}

impl ReadOptions {
    pub fn create() -> Self {
        Self {
            create_if_not_exists: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<DeliveryMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            delivered: false,
            method: None,
            error: Some(error.into()),
        }
    }
}

pub struct StateStore {
    config: StateConfig,
    bus: Arc<Bus>,
    states: RwLock<HashMap<String, ComponentState>>,
    global: RwLock<BTreeMap<String, Projection>>,
    schemas: RwLock<HashMap<String, StateSchema>>,
    locks: KeyedLocks,
    metrics: Mutex<StateMetrics>,
    snapshot_seq: AtomicU64,
    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StateStore {
    pub fn new(config: StateConfig, bus: Arc<Bus>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            locks: KeyedLocks::new(config.lock_timeout),
            config,
            bus,
            states: RwLock::new(HashMap::new()),
            global: RwLock::new(BTreeMap::new()),
            schemas: RwLock::new(HashMap::new()),
            metrics: Mutex::new(StateMetrics::default()),
            snapshot_seq: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    fn states_read(&self) -> RwLockReadGuard<'_, HashMap<String, ComponentState>> {
        self.states.read().unwrap_or_else(|e| e.into_inner())
    }

    fn states_write(&self) -> RwLockWriteGuard<'_, HashMap<String, ComponentState>> {
        self.states.write().unwrap_or_else(|e| e.into_inner())
    }

    fn global_read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Projection>> {
        self.global.read().unwrap_or_else(|e| e.into_inner())
    }

    fn global_write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Projection>> {
        self.global.write().unwrap_or_else(|e| e.into_inner())
    }

    fn metrics_lock(&self) -> MutexGuard<'_, StateMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(CoreError::ShuttingDown("state store"));
        }
        Ok(())
    }

    // =========================================================================
    // Schemas
    // =========================================================================

    pub fn register_schema(&self, component_type: &str, schema: StateSchema) {
        self.schemas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(component_type.to_string(), schema);
        log(
            Level::Info,
            Domain::State,
            "schema_registered",
            obj(&[("component_type", v_str(component_type))]),
        );
    }

    /// Register every `<componentType>.json` schema in `dir`.
    pub fn load_schema_dir(&self, dir: &Path) -> CoreResult<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(component_type) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let raw = std::fs::read(&path)?;
            let schema: StateSchema = serde_json::from_slice(&raw)
                .map_err(|e| CoreError::Persistence(format!("{}: {}", path.display(), e)))?;
            self.register_schema(&component_type, schema);
            loaded += 1;
        }
        Ok(loaded)
    }

    fn schema_for(&self, component_id: &str) -> Option<StateSchema> {
        let kind = self.bus.component(component_id)?.kind;
        self.schemas.read().unwrap_or_else(|e| e.into_inner()).get(&kind).cloned()
    }

    // =========================================================================
    // Mutation and reads
    // =========================================================================

    /// Merge `patch` into the component's state under its key lock.
    ///
    /// The lock is released before `state-changed` goes out, on every path.
    /// A schema violation leaves the stored state untouched.
    pub async fn update(&self, component_id: &str, patch: Value, options: UpdateOptions) -> CoreResult<Value> {
        self.ensure_open()?;
        if !is_valid_id(component_id) {
            return Err(CoreError::invalid("componentId", "invalid id format"));
        }
        if !patch.is_object() {
            return Err(CoreError::invalid("patch", "expected object"));
        }
        let _profile = ProfileScope::with_context("state_update", &[("component_id", v_str(component_id))]);

        let guard = match self.locks.acquire(component_id).await {
            Ok(guard) => guard,
            Err(e) => {
                self.metrics_lock().lock_timeouts += 1;
                return Err(e);
            }
        };
        let committed = self.apply(component_id, &patch, options.global);
        drop(guard);

        let state = committed?;
        if options.notify {
            self.notify_change(&state).await;
        }
        Ok(state.data)
    }

    fn apply(&self, component_id: &str, patch: &Value, global: bool) -> CoreResult<ComponentState> {
        let now = now_ms();
        let current = self
            .states_read()
            .get(component_id)
            .cloned()
            .unwrap_or_else(|| ComponentState::seed(component_id, now));

        let mut merged = current.data.clone();
        deep_merge(&mut merged, patch);
        if let Some(schema) = self.schema_for(component_id) {
            if let Err(e) = validate_state_against_schema(&merged, &schema) {
                self.metrics_lock().validation_failures += 1;
                return Err(e);
            }
        }

        let mut next = current;
        next.commit(merged, now, self.config.history_limit);
        {
            let mut states = self.states_write();
            states.insert(component_id.to_string(), next.clone());
            if global {
                self.global_write()
                    .insert(component_id.to_string(), Projection::of(&next, &self.config.projected_metrics));
            }
        }
        self.metrics_lock().updates += 1;
        let keys = patch.as_object().map(|o| o.len()).unwrap_or(0);
        log_state_commit(component_id, next.version, keys, global);
        Ok(next)
    }

    async fn notify_change(&self, state: &ComponentState) {
        let payload = Payload::event(
            events::STATE_CHANGED,
            json!({
                "componentId": state.component_id,
                "version": state.version,
                "timestamp": state.timestamp,
                "state": state.data,
            }),
        );
        let result = self
            .bus
            .broadcast(
                STATE_STORE_ID,
                payload,
                EnvelopeOptions::default().topic(events::STATE_CHANGED),
                BroadcastFilter::Capability(STATE_SUBSCRIBER.to_string()),
            )
            .await;
        match result {
            Ok(report) if !report.failures.is_empty() => log(
                Level::Warn,
                Domain::State,
                "state_notify_partial",
                obj(&[
                    ("component_id", v_str(&state.component_id)),
                    ("failures", json!(report.failures)),
                ]),
            ),
            Ok(_) => {}
            Err(e) => log(
                Level::Warn,
                Domain::State,
                "state_notify_failed",
                obj(&[("component_id", v_str(&state.component_id)), ("error", v_str(&e.to_string()))]),
            ),
        }
    }

    /// Current state document. With `create_if_not_exists`, an absent state
    /// is seeded under the key lock; an existing one is never overwritten.
    pub async fn read(&self, component_id: &str, options: ReadOptions) -> CoreResult<Option<Value>> {
        let existing = self.states_read().get(component_id).map(|s| s.data.clone());
        if existing.is_some() || !options.create_if_not_exists {
            return Ok(existing);
        }
        self.ensure_open()?;
        if !is_valid_id(component_id) {
            return Err(CoreError::invalid("componentId", "invalid id format"));
        }

        let _guard = self.locks.acquire(component_id).await?;
        let now = now_ms();
        let state = {
            let mut states = self.states_write();
            let state = states
                .entry(component_id.to_string())
                .or_insert_with(|| ComponentState::seed(component_id, now))
                .clone();
            self.global_write()
                .entry(component_id.to_string())
                .or_insert_with(|| Projection::of(&state, &self.config.projected_metrics));
            state
        };
        Ok(Some(state.data))
    }

    pub fn record(&self, component_id: &str) -> Option<ComponentState> {
        self.states_read().get(component_id).cloned()
    }

    pub fn history(&self, component_id: &str) -> Vec<HistoryEntry> {
        self.states_read()
            .get(component_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn query(&self, query: &StateQuery) -> BTreeMap<String, Value> {
        let of_type: Option<HashSet<String>> = match query {
            StateQuery::ComponentType(kind) => Some(
                self.bus
                    .components()
                    .into_iter()
                    .filter(|c| &c.kind == kind)
                    .map(|c| c.id)
                    .collect(),
            ),
            _ => None,
        };
        let states = self.states_read();
        match query {
            StateQuery::Component(id) => states
                .get(id)
                .map(|s| (id.clone(), s.data.clone()))
                .into_iter()
                .collect(),
            StateQuery::ComponentType(_) => {
                let ids = of_type.unwrap_or_default();
                states
                    .iter()
                    .filter(|(id, _)| ids.contains(*id))
                    .map(|(id, s)| (id.clone(), s.data.clone()))
                    .collect()
            }
            StateQuery::All => states.iter().map(|(id, s)| (id.clone(), s.data.clone())).collect(),
        }
    }

    pub fn global_state(&self) -> BTreeMap<String, Projection> {
        self.global_read().clone()
    }

    pub fn component_states(&self) -> BTreeMap<String, ComponentState> {
        self.states_read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.states_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> StateMetrics {
        self.metrics_lock().clone()
    }

    /// Keys with a mutation in flight.
    pub fn locks_held(&self) -> Vec<String> {
        self.locks.held()
    }

    /// Push each target's state to it as a `state` envelope (`stateType = sync`).
    /// Targets default to every component with state; each outcome is recorded
    /// independently.
    pub async fn synchronize(&self, targets: Option<&[String]>) -> BTreeMap<String, SyncOutcome> {
        let ids: Vec<String> = match targets {
            Some(t) => t.to_vec(),
            None => self.component_states().into_keys().collect(),
        };
        let mut outcomes = BTreeMap::new();
        for id in ids {
            let outcome = match self.record(&id) {
                None => SyncOutcome::failed("no state for component"),
                Some(state) => {
                    let sent = self
                        .bus
                        .send(
                            &id,
                            STATE_STORE_ID,
                            Payload::state(StateOp::Sync, state.data, state.version),
                            EnvelopeOptions::default().topic(events::STATE_SYNC),
                        )
                        .await;
                    match sent {
                        Ok(report) => SyncOutcome {
                            delivered: report.delivered,
                            method: Some(report.method),
                            error: report.error,
                        },
                        Err(e) => SyncOutcome::failed(e.to_string()),
                    }
                }
            };
            outcomes.insert(id, outcome);
        }
        self.metrics_lock().synchronizations += 1;
        log(
            Level::Info,
            Domain::State,
            "state_synchronized",
            obj(&[
                ("targets", json!(outcomes.len())),
                ("delivered", json!(outcomes.values().filter(|o| o.delivered).count())),
            ]),
        );
        outcomes
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn capture(&self) -> Snapshot {
        let (global_state, component_states) = {
            let states = self.states_read();
            let global = self.global_read();
            let component_states: BTreeMap<String, ComponentState> =
                states.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            (global.clone(), component_states)
        };
        Snapshot::new(now_ms(), global_state, component_states, self.metrics())
    }

    /// Write a snapshot and prune old ones. Failures are logged and returned;
    /// in-memory state is never touched.
    pub async fn snapshot(&self) -> CoreResult<PathBuf> {
        let _profile = ProfileScope::new("state_snapshot");
        let captured = self.capture();
        let components = captured.component_states.len();
        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst);
        let dir = self.config.snapshot_dir.clone();
        let keep = self.config.snapshot_retention;

        let written = tokio::task::spawn_blocking(move || -> CoreResult<(PathBuf, usize, usize)> {
            let (path, bytes) = snapshot::write_atomic(&dir, &captured, seq)?;
            let pruned = snapshot::prune(&dir, keep)?;
            Ok((path, bytes, pruned))
        })
        .await
        .map_err(|e| CoreError::Persistence(e.to_string()))
        .and_then(|r| r);

        match written {
            Ok((path, bytes, pruned)) => {
                self.metrics_lock().snapshots += 1;
                log_snapshot(&path.display().to_string(), components, bytes, pruned);
                Ok(path)
            }
            Err(e) => {
                self.metrics_lock().snapshot_failures += 1;
                log_persistence_error("snapshot", &e.to_string());
                Err(e)
            }
        }
    }

    /// Replace in-memory state with the newest valid snapshot. No snapshot
    /// means a cold start with whatever is already in memory.
    pub fn restore(&self) -> CoreResult<Option<PathBuf>> {
        let Some((path, loaded)) = snapshot::load_newest(&self.config.snapshot_dir)? else {
            log(
                Level::Info,
                Domain::Persist,
                "cold_start",
                obj(&[("dir", v_str(&self.config.snapshot_dir.display().to_string()))]),
            );
            return Ok(None);
        };
        let components = loaded.component_states.len();
        {
            let mut states = self.states_write();
            let mut global = self.global_write();
            *states = loaded.component_states.into_iter().collect();
            *global = loaded.global_state;
        }
        log(
            Level::Info,
            Domain::Persist,
            "snapshot_restored",
            obj(&[("path", v_str(&path.display().to_string())), ("components", json!(components))]),
        );
        Ok(Some(path))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load schemas, restore the newest snapshot, then start the snapshot
    /// timer and the bus-event bridge that seeds state for new components.
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        let startup = |reason: String| CoreError::Startup {
            stage: "state".to_string(),
            reason,
        };
        if let Some(dir) = &self.config.schema_dir {
            let loaded = self
                .load_schema_dir(dir)
                .map_err(|e| startup(format!("schemas from {}: {}", dir.display(), e)))?;
            log(Level::Info, Domain::State, "schemas_loaded", obj(&[("count", json!(loaded))]));
        }
        self.restore().map_err(|e| startup(e.to_string()))?;

        let mut tasks = vec![tokio::spawn(bridge_loop(
            Arc::clone(self),
            self.bus.subscribe(),
            self.shutdown_tx.subscribe(),
        ))];
        if !self.config.snapshot_interval.is_zero() {
            tasks.push(tokio::spawn(snapshot_loop(Arc::clone(self), self.shutdown_tx.subscribe())));
        }
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).extend(tasks);
        log(
            Level::Info,
            Domain::State,
            "state_store_started",
            obj(&[("components", json!(self.len()))]),
        );
        Ok(())
    }

    /// Refuse new mutations, wait for in-flight ones, stop the timers and
    /// write a final snapshot.
    pub async fn shutdown(&self) -> CoreResult<()> {
        if !self.stop_tasks().await {
            return Ok(());
        }
        let stuck = self.locks.drain(self.config.lock_timeout).await;
        if !stuck.is_empty() {
            log(
                Level::Warn,
                Domain::State,
                "locks_still_held",
                obj(&[("keys", v_str(&stuck.join(",")))]),
            );
        }
        self.snapshot().await.map(|_| ())
    }

    /// Stop without a final snapshot. Used when startup fails part way, so a
    /// half-restored store never overwrites the newest good snapshot.
    pub async fn halt(&self) {
        self.stop_tasks().await;
    }

    /// Returns false when the store was already closing.
    async fn stop_tasks(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for mut task in tasks {
            if tokio::time::timeout(TASK_DRAIN, &mut task).await.is_err() {
                task.abort();
            }
        }
        true
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

async fn bridge_loop(store: Arc<StateStore>, mut events: broadcast::Receiver<BusEvent>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(BusEvent::ComponentRegistered { component, .. }) => {
                    if let Err(e) = store.read(&component.id, ReadOptions::create()).await {
                        log(
                            Level::Warn,
                            Domain::State,
                            "seed_failed",
                            obj(&[("component_id", v_str(&component.id)), ("error", v_str(&e.to_string()))]),
                        );
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => log(
                    Level::Warn,
                    Domain::State,
                    "bus_events_lagged",
                    obj(&[("missed", json!(missed))]),
                ),
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn snapshot_loop(store: Arc<StateStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(store.config.snapshot_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // failures already logged
                let _ = store.snapshot().await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::contract::{FieldKind, FieldRule, Registration};

    fn store_in(dir: &Path) -> Arc<StateStore> {
        let bus = Arc::new(Bus::new(BusConfig::default()).unwrap());
        let config = StateConfig {
            snapshot_dir: dir.to_path_buf(),
            lock_timeout: Duration::from_millis(200),
            history_limit: 3,
            ..StateConfig::default()
        };
        Arc::new(StateStore::new(config, bus))
    }

    #[tokio::test]
    async fn test_update_merges_onto_seed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.read("a", ReadOptions::create()).await.unwrap();
        let state = store
            .update("a", json!({"status": "active", "pnl": 125.5}), UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!(state["status"], "active");
        assert_eq!(state["pnl"], 125.5);
        assert_eq!(state["id"], "a");
        assert!(state["data"].is_object());
        assert_eq!(store.record("a").unwrap().version, 2);
        assert_eq!(store.global_state()["a"].metrics["pnl"], json!(125.5));
    }

    #[tokio::test]
    async fn test_read_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.read("nobody", ReadOptions::default()).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_seed_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.update("a", json!({"x": 1}), UpdateOptions::default()).await.unwrap();
        let read = store.read("a", ReadOptions::create()).await.unwrap().unwrap();
        assert_eq!(read["x"], 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut patch = serde_json::Map::new();
                patch.insert(format!("k{}", i), json!(i));
                store.update("a", Value::Object(patch), UpdateOptions::default()).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let state = store.read("a", ReadOptions::default()).await.unwrap().unwrap();
        for i in 0..20 {
            assert_eq!(state[format!("k{}", i)], i);
        }
        assert_eq!(store.history("a").len(), 3);
    }

    #[tokio::test]
    async fn test_lock_timeout_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let _held = store.locks.acquire("a").await.unwrap();
        let err = store.update("a", json!({"x": 1}), UpdateOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "LOCK_TIMEOUT");
        assert_eq!(store.metrics().lock_timeouts, 1);
        assert!(store.record("a").is_none());
    }

    #[tokio::test]
    async fn test_schema_violation_leaves_state_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .bus
            .register(Registration::new("exec", "trading").with_id("exec-1"))
            .await
            .unwrap();
        store.register_schema(
            "trading",
            StateSchema::new().field("pnl", FieldRule::optional(FieldKind::Number)),
        );
        store.update("exec-1", json!({"pnl": 1.0}), UpdateOptions::default()).await.unwrap();

        let err = store
            .update("exec-1", json!({"pnl": "lots"}), UpdateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(store.read("exec-1", ReadOptions::default()).await.unwrap().unwrap()["pnl"], 1.0);
        assert!(store.locks_held().is_empty());
        store.update("exec-1", json!({"pnl": 2.0}), UpdateOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_global_option_skips_projection() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let opts = UpdateOptions {
            global: false,
            notify: false,
        };
        store.update("a", json!({"pnl": 3}), opts).await.unwrap();
        assert!(store.global_state().is_empty());
    }

    #[tokio::test]
    async fn test_state_changed_reaches_subscribers_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let sub = store
            .bus
            .register(Registration::new("dash", "dashboard").with_capability(STATE_SUBSCRIBER))
            .await
            .unwrap();
        let other = store.bus.register(Registration::new("exec", "trading")).await.unwrap();
        let mut sub_rx = store.bus.attach(&sub).unwrap();
        let mut other_rx = store.bus.attach(&other).unwrap();
        while sub_rx.try_recv().is_ok() {}
        while other_rx.try_recv().is_ok() {}

        store.update(&other, json!({"pnl": 9}), UpdateOptions::default()).await.unwrap();
        let change = sub_rx.try_recv().unwrap();
        assert_eq!(change.payload.event_name(), Some(events::STATE_CHANGED));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_query_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let exec = store.bus.register(Registration::new("exec", "trading")).await.unwrap();
        let scan = store.bus.register(Registration::new("scan", "analysis")).await.unwrap();
        for id in [&exec, &scan] {
            store.read(id, ReadOptions::create()).await.unwrap();
        }
        let trading = store.query(&StateQuery::ComponentType("trading".into()));
        assert_eq!(trading.keys().collect::<Vec<_>>(), vec![&exec]);
        assert_eq!(store.query(&StateQuery::All).len(), 2);
        assert_eq!(store.query(&StateQuery::Component(scan.clone())).len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore_is_byte_equal_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.update("a", json!({"pnl": 0.1, "nested": {"v": [1, 2]}}), UpdateOptions::default()).await.unwrap();
        store.update("b", json!({"health": 0.97}), UpdateOptions::default()).await.unwrap();
        store.snapshot().await.unwrap();

        let fresh = store_in(dir.path());
        assert!(fresh.restore().unwrap().is_some());
        let bytes = |s: &StateStore| {
            (
                serde_json::to_vec(&s.component_states()).unwrap(),
                serde_json::to_vec(&s.global_state()).unwrap(),
            )
        };
        assert_eq!(bytes(&fresh), bytes(&store));
        fresh.restore().unwrap();
        assert_eq!(bytes(&fresh), bytes(&store));
    }

    #[tokio::test]
    async fn test_snapshot_failure_keeps_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let store = store_in(&blocker.join("snapshots"));
        store.update("a", json!({"x": 1}), UpdateOptions::default()).await.unwrap();

        let err = store.snapshot().await.unwrap_err();
        assert_eq!(err.code(), "PERSISTENCE_ERROR");
        assert_eq!(store.metrics().snapshot_failures, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_synchronize_records_each_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let a = store.bus.register(Registration::new("exec", "trading")).await.unwrap();
        let mut rx = store.bus.attach(&a).unwrap();
        store.update(&a, json!({"pnl": 5}), UpdateOptions { global: true, notify: false }).await.unwrap();

        let targets = vec![a.clone(), "ghost".to_string()];
        let outcomes = store.synchronize(Some(&targets)).await;
        assert!(outcomes[&a].delivered);
        assert!(!outcomes["ghost"].delivered);

        let sync = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|e| e.kind() == crate::contract::MessageKind::State)
            .unwrap();
        match sync.payload {
            Payload::State(p) => {
                assert_eq!(p.state_type, StateOp::Sync);
                assert_eq!(p.state_data["pnl"], 5);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_refuses_updates_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.update("a", json!({"x": 1}), UpdateOptions::default()).await.unwrap();
        store.shutdown().await.unwrap();
        assert_eq!(snapshot::list(dir.path()).unwrap().len(), 1);
        let err = store.update("a", json!({"x": 2}), UpdateOptions::default()).await.unwrap_err();
        assert_eq!(err, CoreError::ShuttingDown("state store"));
    }

    #[tokio::test]
    async fn test_load_schema_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("trading.json"),
            r#"{"fields": {"status": {"required": true, "type": "string"}}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();
        let store = store_in(dir.path());
        assert_eq!(store.load_schema_dir(dir.path()).unwrap(), 1);
        assert!(store.schemas.read().unwrap().contains_key("trading"));
    }
}
