//! Component registry and message router.
//!
//! Delivery order for a single envelope: the recipient's persistent
//! connection, then its `http` endpoint, then the outbox. Expired envelopes
//! are dropped before any of those is tried.

pub mod heartbeat;
pub mod outbox;
pub mod registry;
pub mod server;
pub mod transport;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

pub use outbox::{Outbox, QueuedEnvelope};
pub use registry::{BroadcastFilter, Component, ComponentStatus};
pub use transport::{HttpTransport, Transport, TransportError};

use crate::config::BusConfig;
use crate::contract::taxonomy::events;
use crate::contract::{
    build_envelope, check_envelope, new_id, validate_registration, Envelope, EnvelopeOptions, Payload, Registration,
    BROADCAST,
};
use crate::error::{CoreError, CoreResult};
use crate::logging::{
    log, log_broadcast, log_component_registered, log_component_unregistered, log_delivery, log_persistence_error,
    log_status_change, obj, v_str, Domain, Level,
};
use crate::now_ms;
use crate::reliability::circuit::CircuitBreaker;

/// Sender id used for envelopes the bus itself originates.
pub const BUS_ID: &str = "bus";

const RETRY_BATCH: usize = 64;
const LEASE_SLACK_MS: i64 = 5_000;
/// Added to `http_timeout` so an in-flight delivery can finish before its task is aborted.
const TASK_DRAIN_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    Connection,
    Http,
    Queued,
    Dropped,
    Broadcast,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMethod::Connection => "connection",
            DeliveryMethod::Http => "http",
            DeliveryMethod::Queued => "queued",
            DeliveryMethod::Dropped => "dropped",
            DeliveryMethod::Broadcast => "broadcast",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReport {
    pub envelope_id: String,
    pub delivered: bool,
    pub method: DeliveryMethod,
    /// Recipients reached; 0 or 1 except for broadcasts.
    pub recipients: usize,
    /// Why the envelope was queued or dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientFailure {
    pub component_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub envelope_id: String,
    pub delivered: usize,
    pub queued: usize,
    pub total: usize,
    pub failures: Vec<RecipientFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    Expired,
    RetriesExhausted,
    Rejected,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Expired => "expired",
            DropReason::RetriesExhausted => "retries-exhausted",
            DropReason::Rejected => "rejected",
        }
    }
}

/// In-process notifications for the orchestrator and other observers.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    ComponentRegistered { component: Component, reregistered: bool },
    ComponentUnregistered { component_id: String },
    StatusChanged { component_id: String, from: ComponentStatus, to: ComponentStatus },
    MessageQueued { envelope_id: String, target: String },
    MessageDropped { envelope_id: String, target: String, reason: DropReason },
}

impl BusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::ComponentRegistered { .. } => events::COMPONENT_REGISTERED,
            BusEvent::ComponentUnregistered { .. } => events::COMPONENT_UNREGISTERED,
            BusEvent::StatusChanged { .. } => events::COMPONENT_STATUS_CHANGED,
            BusEvent::MessageQueued { .. } => events::MESSAGE_QUEUED,
            BusEvent::MessageDropped { .. } => events::MESSAGE_DROPPED,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    broadcasts: AtomicU64,
    received: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMetrics {
    pub components: usize,
    pub active: usize,
    pub connections: usize,
    pub sent: u64,
    pub delivered: u64,
    pub queued: u64,
    pub dropped: u64,
    pub failed: u64,
    pub broadcasts: u64,
    pub received: u64,
    pub outbox_depth: usize,
    pub uptime_ms: i64,
}

enum Route {
    Delivered(DeliveryMethod),
    /// No usable transport right now; worth queueing.
    Unavailable(String),
    Failed(TransportError),
}

pub struct Bus {
    config: BusConfig,
    registry: RwLock<HashMap<String, Component>>,
    connections: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
    transport: Arc<dyn Transport>,
    outbox: Mutex<Outbox>,
    circuits: Mutex<HashMap<String, CircuitBreaker>>,
    events: broadcast::Sender<BusEvent>,
    counters: Counters,
    started_at: i64,
    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Bus {
    pub fn new(config: BusConfig) -> CoreResult<Self> {
        Self::with_transport(config, Arc::new(HttpTransport::new()))
    }

    pub fn with_transport(config: BusConfig, transport: Arc<dyn Transport>) -> CoreResult<Self> {
        let outbox = Outbox::open(&config.outbox_path)?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            registry: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            transport,
            outbox: Mutex::new(outbox),
            circuits: Mutex::new(HashMap::new()),
            events,
            counters: Counters::default(),
            started_at: now_ms(),
            closing: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // Poisoned locks are recovered; every critical section leaves the maps consistent.
    fn registry_read(&self) -> RwLockReadGuard<'_, HashMap<String, Component>> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, HashMap<String, Component>> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    fn connections_read(&self) -> RwLockReadGuard<'_, HashMap<String, mpsc::Sender<Envelope>>> {
        self.connections.read().unwrap_or_else(|e| e.into_inner())
    }

    fn connections_write(&self) -> RwLockWriteGuard<'_, HashMap<String, mpsc::Sender<Envelope>>> {
        self.connections.write().unwrap_or_else(|e| e.into_inner())
    }

    fn outbox_lock(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn circuits_lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.circuits.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(CoreError::ShuttingDown("bus"));
        }
        Ok(())
    }

    fn publish(&self, event: BusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn notice_options(&self) -> EnvelopeOptions {
        EnvelopeOptions::default().ttl(self.config.default_ttl_ms)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Register a component, or refresh it when the explicit id is already
    /// known. Peers hear `component-joined` only for new registrations.
    pub async fn register(&self, registration: Registration) -> CoreResult<String> {
        self.ensure_open()?;
        validate_registration(&registration)?;
        let now = now_ms();
        let id = registration.id.clone().unwrap_or_else(new_id);

        let (component, previous) = {
            let mut registry = self.registry_write();
            match registry.entry(id.clone()) {
                Entry::Occupied(mut slot) => {
                    let previous = slot.get().status;
                    slot.get_mut().refresh(registration, now);
                    (slot.get().clone(), Some(previous))
                }
                Entry::Vacant(slot) => {
                    let component = Component::from_registration(id.clone(), registration, now);
                    slot.insert(component.clone());
                    (component, None)
                }
            }
        };

        let reregistered = previous.is_some();
        log_component_registered(&component.id, &component.name, &component.kind, reregistered);
        if let Some(from) = previous.filter(|s| *s != component.status) {
            self.status_changed(&id, from, component.status);
        }
        self.publish(BusEvent::ComponentRegistered {
            component: component.clone(),
            reregistered,
        });

        if !reregistered {
            let notice = build_envelope(
                BUS_ID,
                BROADCAST,
                Payload::event(events::COMPONENT_JOINED, json!({ "component": component })),
                self.notice_options(),
            );
            let joined = id.clone();
            self.broadcast_envelope(&notice, &BroadcastFilter::predicate(move |c| c.id != joined))
                .await;
        }
        Ok(id)
    }

    /// Remove a component, its connection and its queued envelopes.
    /// Returns whether it was registered.
    pub async fn unregister(&self, component_id: &str) -> bool {
        let removed = self.registry_write().remove(component_id);
        let Some(component) = removed else {
            return false;
        };
        self.connections_write().remove(component_id);
        self.circuits_lock().remove(component_id);
        let purged = self.outbox_lock().purge_target(component_id);
        if let Err(e) = purged {
            log_persistence_error("outbox_purge", &e.to_string());
        }

        log_component_unregistered(component_id);
        self.publish(BusEvent::ComponentUnregistered {
            component_id: component_id.to_string(),
        });

        let notice = build_envelope(
            BUS_ID,
            BROADCAST,
            Payload::event(
                events::COMPONENT_LEFT,
                json!({ "componentId": component.id, "name": component.name }),
            ),
            self.notice_options(),
        );
        self.broadcast_envelope(&notice, &BroadcastFilter::All).await;
        true
    }

    pub fn component(&self, component_id: &str) -> Option<Component> {
        self.registry_read().get(component_id).cloned()
    }

    pub fn is_registered(&self, component_id: &str) -> bool {
        self.registry_read().contains_key(component_id)
    }

    /// Snapshot of the registry, ordered by id.
    pub fn components(&self) -> Vec<Component> {
        let mut all: Vec<Component> = self.registry_read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn status_changed(&self, component_id: &str, from: ComponentStatus, to: ComponentStatus) {
        log_status_change(component_id, from.as_str(), to.as_str());
        self.publish(BusEvent::StatusChanged {
            component_id: component_id.to_string(),
            from,
            to,
        });
    }

    pub fn set_status(&self, component_id: &str, status: ComponentStatus) -> CoreResult<()> {
        let from = {
            let mut registry = self.registry_write();
            let component = registry
                .get_mut(component_id)
                .ok_or_else(|| CoreError::ComponentNotFound(component_id.to_string()))?;
            std::mem::replace(&mut component.status, status)
        };
        if from != status {
            self.status_changed(component_id, from, status);
        }
        Ok(())
    }

    /// Record liveness. An inactive component comes back to active.
    pub fn heartbeat(&self, component_id: &str) -> CoreResult<()> {
        let now = now_ms();
        let revived = {
            let mut registry = self.registry_write();
            let component = registry
                .get_mut(component_id)
                .ok_or_else(|| CoreError::ComponentNotFound(component_id.to_string()))?;
            component.last_heartbeat = now;
            if component.status == ComponentStatus::Inactive {
                component.status = ComponentStatus::Active;
                true
            } else {
                false
            }
        };
        if revived {
            self.status_changed(component_id, ComponentStatus::Inactive, ComponentStatus::Active);
        }
        Ok(())
    }

    /// Mark active components silent for longer than the staleness window as inactive.
    pub fn sweep_stale(&self, now_ms: i64) -> Vec<String> {
        let threshold = self.config.staleness_threshold().as_millis() as i64;
        let stale: Vec<String> = {
            let mut registry = self.registry_write();
            registry
                .values_mut()
                .filter(|c| c.status == ComponentStatus::Active && c.is_stale(now_ms, threshold))
                .map(|c| {
                    c.status = ComponentStatus::Inactive;
                    c.id.clone()
                })
                .collect()
        };
        for id in &stale {
            self.status_changed(id, ComponentStatus::Active, ComponentStatus::Inactive);
        }
        stale
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Open the persistent delivery channel for a component. Anything queued
    /// for it is pushed into the channel before the channel becomes visible
    /// to senders, so live traffic never overtakes the backlog.
    pub fn attach(&self, component_id: &str) -> CoreResult<mpsc::Receiver<Envelope>> {
        self.ensure_open()?;
        if !self.is_registered(component_id) {
            return Err(CoreError::ComponentNotFound(component_id.to_string()));
        }
        let (tx, rx) = mpsc::channel(self.config.connection_capacity.max(1));

        let now = now_ms();
        let backlog = self.outbox_lock().lease_for(component_id, now, now + self.lease_window_ms())?;
        let mut settled = Vec::new();
        let mut unsent = Vec::new();
        let mut flushed = 0usize;
        for entry in backlog {
            if !unsent.is_empty() {
                unsent.push(entry.seq);
                continue;
            }
            if entry.envelope.is_expired_at(now) {
                self.drop_envelope(&entry.envelope.id, component_id, DropReason::Expired);
                settled.push(entry.seq);
                continue;
            }
            match tx.try_send(entry.envelope.clone()) {
                Ok(()) => {
                    flushed += 1;
                    settled.push(entry.seq);
                    bump(&self.counters.delivered);
                    log_delivery(&entry.envelope.id, component_id, DeliveryMethod::Connection.as_str(), None);
                }
                // Channel full: the rest waits for the retry loop.
                Err(_) => unsent.push(entry.seq),
            }
        }
        self.connections_write().insert(component_id.to_string(), tx);

        // The receiver is live from here on, so a bookkeeping failure only
        // risks a duplicate delivery, never a lost one.
        let bookkeeping = {
            let mut outbox = self.outbox_lock();
            outbox.complete(&settled).and_then(|()| outbox.release(&unsent))
        };
        if let Err(e) = bookkeeping {
            log_persistence_error("outbox_flush", &e.to_string());
        }

        log(
            Level::Info,
            Domain::Bus,
            "connection_attached",
            obj(&[
                ("component_id", v_str(component_id)),
                ("flushed", json!(flushed)),
                ("still_queued", json!(unsent.len())),
            ]),
        );
        Ok(rx)
    }

    pub fn detach(&self, component_id: &str) -> bool {
        self.connections_write().remove(component_id).is_some()
    }

    /// Drop the connection entry only if its receiver is gone, so a newer
    /// connection for the same component survives an old one closing.
    pub fn detach_closed(&self, component_id: &str) -> bool {
        let mut connections = self.connections_write();
        let closed = connections.get(component_id).map(|tx| tx.is_closed()).unwrap_or(false);
        if closed {
            connections.remove(component_id);
            log(
                Level::Info,
                Domain::Bus,
                "connection_detached",
                obj(&[("component_id", v_str(component_id))]),
            );
        }
        closed
    }

    pub fn note_received(&self) {
        bump(&self.counters.received);
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn circuit_allows(&self, component_id: &str) -> bool {
        let mut circuits = self.circuits_lock();
        circuits
            .entry(component_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.circuit_threshold, self.config.circuit_cooldown))
            .allow()
    }

    fn circuit_record(&self, component_id: &str, ok: bool) {
        if let Some(breaker) = self.circuits_lock().get_mut(component_id) {
            if ok {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    async fn try_routes(&self, component: &Component, envelope: &Envelope) -> Route {
        let mut reason = "no connection or http endpoint".to_string();

        let tx = self.connections_read().get(&component.id).cloned();
        if let Some(tx) = tx {
            match tx.try_send(envelope.clone()) {
                Ok(()) => return Route::Delivered(DeliveryMethod::Connection),
                Err(TrySendError::Full(_)) => reason = "connection backlog full".to_string(),
                Err(TrySendError::Closed(_)) => {
                    self.detach_closed(&component.id);
                    reason = "connection closed".to_string();
                }
            }
        }

        let Some(address) = component.http_endpoint() else {
            return Route::Unavailable(reason);
        };
        if !self.circuit_allows(&component.id) {
            return Route::Unavailable(format!("circuit open for {}", component.id));
        }
        let timeout = envelope
            .remaining(now_ms())
            .map(|left| left.min(self.config.http_timeout))
            .unwrap_or(self.config.http_timeout);
        if timeout.is_zero() {
            return Route::Unavailable("ttl elapsed before http attempt".to_string());
        }
        match self.transport.deliver(address, envelope, timeout).await {
            Ok(()) => {
                self.circuit_record(&component.id, true);
                Route::Delivered(DeliveryMethod::Http)
            }
            Err(e) => {
                self.circuit_record(&component.id, false);
                Route::Failed(e)
            }
        }
    }

    fn enqueue(&self, target: &str, envelope: &Envelope) -> CoreResult<()> {
        let next = now_ms() + self.config.retry.delay_for_attempt(0).as_millis() as i64;
        self.outbox_lock().enqueue(target, envelope, next)?;
        bump(&self.counters.queued);
        self.publish(BusEvent::MessageQueued {
            envelope_id: envelope.id.clone(),
            target: target.to_string(),
        });
        Ok(())
    }

    fn drop_envelope(&self, envelope_id: &str, target: &str, reason: DropReason) {
        bump(&self.counters.dropped);
        log_delivery(envelope_id, target, DeliveryMethod::Dropped.as_str(), Some(reason.as_str()));
        self.publish(BusEvent::MessageDropped {
            envelope_id: envelope_id.to_string(),
            target: target.to_string(),
            reason,
        });
    }

    /// Deliver a unicast envelope to `envelope.to`.
    ///
    /// Expired envelopes are dropped without error. When no transport is
    /// usable the envelope is queued; a failing HTTP attempt surfaces as
    /// [`CoreError::Delivery`].
    pub async fn deliver(&self, envelope: &Envelope) -> CoreResult<SendReport> {
        let report = |method: DeliveryMethod, delivered: bool, error: Option<String>| SendReport {
            envelope_id: envelope.id.clone(),
            delivered,
            method,
            recipients: usize::from(delivered),
            error,
        };

        if envelope.is_expired_at(now_ms()) {
            self.drop_envelope(&envelope.id, &envelope.to, DropReason::Expired);
            return Ok(report(DeliveryMethod::Dropped, false, Some("expired".to_string())));
        }
        let component = self
            .component(&envelope.to)
            .ok_or_else(|| CoreError::ComponentNotFound(envelope.to.clone()))?;

        match self.try_routes(&component, envelope).await {
            Route::Delivered(method) => {
                bump(&self.counters.delivered);
                log_delivery(&envelope.id, &envelope.to, method.as_str(), None);
                Ok(report(method, true, None))
            }
            Route::Unavailable(reason) => {
                self.enqueue(&envelope.to, envelope)?;
                log_delivery(&envelope.id, &envelope.to, DeliveryMethod::Queued.as_str(), Some(&reason));
                Ok(report(DeliveryMethod::Queued, false, Some(reason)))
            }
            Route::Failed(e) => {
                bump(&self.counters.failed);
                log_delivery(&envelope.id, &envelope.to, DeliveryMethod::Http.as_str(), Some(&e.reason));
                Err(CoreError::Delivery {
                    target: envelope.to.clone(),
                    reason: e.reason,
                })
            }
        }
    }

    /// Route an already-built envelope: fan out broadcasts, deliver the rest.
    pub async fn route(&self, envelope: &Envelope) -> CoreResult<SendReport> {
        self.ensure_open()?;
        bump(&self.counters.sent);
        if envelope.is_broadcast() {
            let report = self.broadcast_envelope(envelope, &BroadcastFilter::All).await;
            return Ok(SendReport {
                envelope_id: report.envelope_id,
                delivered: report.delivered > 0,
                method: DeliveryMethod::Broadcast,
                recipients: report.delivered,
                error: None,
            });
        }
        self.deliver(envelope).await
    }

    /// Build, validate and route a message from `from` to `target`.
    /// `target` may be [`BROADCAST`].
    pub async fn send(
        &self,
        target: &str,
        from: &str,
        payload: Payload,
        options: EnvelopeOptions,
    ) -> CoreResult<SendReport> {
        self.ensure_open()?;
        if target != BROADCAST && !self.is_registered(target) {
            return Err(CoreError::ComponentNotFound(target.to_string()));
        }
        let envelope = build_envelope(from, target, payload, self.with_default_ttl(options));
        check_envelope(&envelope)?;
        self.route(&envelope).await
    }

    /// Send one envelope to every registered component matching `filter`,
    /// excluding the sender. A failing recipient never stops the others.
    pub async fn broadcast(
        &self,
        from: &str,
        payload: Payload,
        options: EnvelopeOptions,
        filter: BroadcastFilter,
    ) -> CoreResult<BroadcastReport> {
        self.ensure_open()?;
        let envelope = build_envelope(from, BROADCAST, payload, self.with_default_ttl(options));
        check_envelope(&envelope)?;
        bump(&self.counters.sent);
        Ok(self.broadcast_envelope(&envelope, &filter).await)
    }

    fn with_default_ttl(&self, mut options: EnvelopeOptions) -> EnvelopeOptions {
        if options.ttl.is_none() {
            options.ttl = Some(self.config.default_ttl_ms);
        }
        options
    }

    async fn broadcast_envelope(&self, envelope: &Envelope, filter: &BroadcastFilter) -> BroadcastReport {
        let recipients: Vec<String> = {
            let registry = self.registry_read();
            let mut ids: Vec<String> = registry
                .values()
                .filter(|c| c.id != envelope.from && filter.matches(c))
                .map(|c| c.id.clone())
                .collect();
            ids.sort();
            ids
        };
        let copies: Vec<Envelope> = recipients.iter().map(|id| envelope.addressed_to(id)).collect();
        let results = join_all(copies.iter().map(|copy| self.deliver(copy))).await;

        let mut report = BroadcastReport {
            envelope_id: envelope.id.clone(),
            delivered: 0,
            queued: 0,
            total: recipients.len(),
            failures: Vec::new(),
        };
        for (component_id, result) in recipients.into_iter().zip(results) {
            match result {
                Ok(r) if r.delivered => report.delivered += 1,
                Ok(r) if r.method == DeliveryMethod::Queued => report.queued += 1,
                Ok(_) => {}
                Err(e) => report.failures.push(RecipientFailure {
                    component_id,
                    error: e.to_string(),
                }),
            }
        }
        bump(&self.counters.broadcasts);
        log_broadcast(&envelope.id, report.delivered, report.total, report.failures.len());
        report
    }

    /// Heartbeat event to every component, carrying current metrics.
    pub async fn emit_heartbeat(&self) -> BroadcastReport {
        let ttl = (self.config.heartbeat_interval.as_millis() as u64).max(1);
        let beat = build_envelope(
            BUS_ID,
            BROADCAST,
            Payload::event(events::HEARTBEAT, json!({ "metrics": self.metrics() })),
            EnvelopeOptions::default().ttl(ttl),
        );
        self.broadcast_envelope(&beat, &BroadcastFilter::All).await
    }

    /// How long a leased outbox row belongs to one delivery pass. Leases
    /// are also released at shutdown and when the outbox is reopened.
    fn lease_window_ms(&self) -> i64 {
        (self.config.http_timeout * RETRY_BATCH as u32).as_millis() as i64 + LEASE_SLACK_MS
    }

    /// One pass over the outbox: purge expired entries, then retry those
    /// whose backoff elapsed. Returns how many were delivered.
    ///
    /// Rows are leased, not removed, while an attempt is in flight. A pass
    /// cut short by shutdown leaves its untried rows queued.
    pub async fn retry_queued(&self) -> CoreResult<usize> {
        let now = now_ms();
        let expired = self.outbox_lock().purge_expired(now)?;
        for (target, envelope_id) in expired {
            self.drop_envelope(&envelope_id, &target, DropReason::Expired);
        }

        let due = self.outbox_lock().lease_due(now, RETRY_BATCH, now + self.lease_window_ms())?;
        let mut delivered = 0;
        let mut pending = due.into_iter();
        while let Some(entry) = pending.next() {
            if self.is_closing() {
                let untried: Vec<i64> = std::iter::once(entry.seq).chain(pending.by_ref().map(|e| e.seq)).collect();
                self.outbox_lock().release(&untried)?;
                break;
            }
            let Some(component) = self.component(&entry.target) else {
                self.drop_envelope(&entry.envelope.id, &entry.target, DropReason::Rejected);
                self.outbox_lock().complete(&[entry.seq])?;
                continue;
            };
            match self.try_routes(&component, &entry.envelope).await {
                Route::Delivered(method) => {
                    delivered += 1;
                    bump(&self.counters.delivered);
                    log_delivery(&entry.envelope.id, &entry.target, method.as_str(), None);
                    self.outbox_lock().complete(&[entry.seq])?;
                }
                Route::Failed(e) if !e.retryable => {
                    log_delivery(&entry.envelope.id, &entry.target, DeliveryMethod::Http.as_str(), Some(&e.reason));
                    self.drop_envelope(&entry.envelope.id, &entry.target, DropReason::Rejected);
                    self.outbox_lock().complete(&[entry.seq])?;
                }
                _ => {
                    if self.config.retry.exhausted(entry.attempts + 1) {
                        self.drop_envelope(&entry.envelope.id, &entry.target, DropReason::RetriesExhausted);
                        self.outbox_lock().complete(&[entry.seq])?;
                    } else {
                        let delay = self.config.retry.delay_for_attempt(entry.attempts + 1);
                        self.outbox_lock().reschedule(&entry, now_ms() + delay.as_millis() as i64)?;
                    }
                }
            }
        }
        Ok(delivered)
    }

    pub fn metrics(&self) -> BusMetrics {
        let (components, active) = {
            let registry = self.registry_read();
            let active = registry.values().filter(|c| c.status == ComponentStatus::Active).count();
            (registry.len(), active)
        };
        let connections = self.connections_read().len();
        let outbox_depth = self.outbox_lock().len().unwrap_or(0);
        BusMetrics {
            components,
            active,
            connections,
            sent: read(&self.counters.sent),
            delivered: read(&self.counters.delivered),
            queued: read(&self.counters.queued),
            dropped: read(&self.counters.dropped),
            failed: read(&self.counters.failed),
            broadcasts: read(&self.counters.broadcasts),
            received: read(&self.counters.received),
            outbox_depth,
            uptime_ms: now_ms() - self.started_at,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bind the WebSocket listener (when configured) and start the
    /// heartbeat and retry loops. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> CoreResult<Option<SocketAddr>> {
        let startup = |reason: String| CoreError::Startup {
            stage: "bus".to_string(),
            reason,
        };
        self.config.check_intervals().map_err(startup)?;
        let mut tasks = Vec::new();
        let mut bound = None;
        if let Some(addr) = self.config.listen_addr {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| startup(format!("bind {}: {}", addr, e)))?;
            let local = listener.local_addr().map_err(|e| startup(e.to_string()))?;
            bound = Some(local);
            tasks.push(tokio::spawn(server::run_listener(
                Arc::clone(self),
                listener,
                self.shutdown_signal(),
            )));
        }
        tasks.push(tokio::spawn(heartbeat::heartbeat_loop(Arc::clone(self), self.shutdown_signal())));
        tasks.push(tokio::spawn(heartbeat::retry_loop(Arc::clone(self), self.shutdown_signal())));

        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = bound;
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).extend(tasks);

        log(
            Level::Info,
            Domain::Bus,
            "bus_started",
            obj(&[
                (
                    "listen_addr",
                    bound.map(|a| v_str(&a.to_string())).unwrap_or(serde_json::Value::Null),
                ),
                ("transport", v_str(self.transport.name())),
            ]),
        );
        Ok(bound)
    }

    /// Refuse new work, stop background loops and close every connection.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let drain = self.config.http_timeout + TASK_DRAIN_SLACK;
        for mut task in tasks {
            if tokio::time::timeout(drain, &mut task).await.is_err() {
                task.abort();
            }
        }
        let released = self.outbox_lock().release_all();
        if let Err(e) = released {
            log_persistence_error("outbox_release", &e.to_string());
        }
        let closed = {
            let mut connections = self.connections_write();
            let n = connections.len();
            connections.clear();
            n
        };
        log(
            Level::Info,
            Domain::Bus,
            "bus_stopped",
            obj(&[("connections_closed", json!(closed)), ("metrics", json!(self.metrics()))]),
        );
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct MockTransport {
        calls: Mutex<Vec<(String, String)>>,
        failing: AtomicBool,
        retryable: AtomicBool,
        stall_ms: AtomicU64,
    }

    impl MockTransport {
        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn fail(&self, on: bool, retryable: bool) {
            self.failing.store(on, Ordering::SeqCst);
            self.retryable.store(retryable, Ordering::SeqCst);
        }

        /// Every delivery sleeps for its whole timeout.
        fn stall(&self, ms: u64) {
            self.stall_ms.store(ms, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn deliver(&self, address: &str, envelope: &Envelope, timeout: Duration) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push((address.to_string(), envelope.id.clone()));
            let stall = self.stall_ms.load(Ordering::SeqCst);
            if stall > 0 {
                tokio::time::sleep(timeout.min(Duration::from_millis(stall))).await;
                return Err(TransportError::retryable("timed out"));
            }
            if self.failing.load(Ordering::SeqCst) {
                let reason = "http 503: unavailable";
                return Err(if self.retryable.load(Ordering::SeqCst) {
                    TransportError::retryable(reason)
                } else {
                    TransportError::fatal(reason)
                });
            }
            Ok(())
        }
    }

    fn test_bus() -> (Bus, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        let config = BusConfig {
            circuit_threshold: 2,
            retry: crate::reliability::retry::RetryConfig {
                max_retries: 1,
                base_delay_ms: 0,
                max_delay_ms: 0,
                jitter_factor: 0.0,
            },
            ..BusConfig::default()
        };
        let bus = Bus::with_transport(config, transport.clone()).unwrap();
        (bus, transport)
    }

    fn market_data() -> Payload {
        Payload::Standard(json!({"symbol": "BTCUSDT", "price": 45000}))
    }

    #[tokio::test]
    async fn test_register_assigns_id_and_announces_join() {
        let (bus, _) = test_bus();
        let a = bus.register(Registration::new("feed", "data")).await.unwrap();
        let mut rx = bus.attach(&a).unwrap();

        let b = bus.register(Registration::new("scanner", "analysis")).await.unwrap();
        assert_ne!(a, b);
        let joined = rx.try_recv().unwrap();
        assert_eq!(joined.payload.event_name(), Some(events::COMPONENT_JOINED));
        assert_eq!(joined.to, a);
    }

    #[tokio::test]
    async fn test_reregister_refreshes_without_announcing() {
        let (bus, _) = test_bus();
        let a = bus.register(Registration::new("feed", "data").with_id("feed-1")).await.unwrap();
        assert_eq!(a, "feed-1");
        let peer = bus.register(Registration::new("peer", "data")).await.unwrap();
        let mut rx = bus.attach(&peer).unwrap();

        let again = bus
            .register(Registration::new("feed-v2", "data").with_id("feed-1"))
            .await
            .unwrap();
        assert_eq!(again, "feed-1");
        assert_eq!(bus.component("feed-1").unwrap().name, "feed-v2");
        assert_eq!(bus.components().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_registration_rejected() {
        let (bus, _) = test_bus();
        let err = bus.register(Registration::new("", "data")).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_send_over_connection() {
        let (bus, transport) = test_bus();
        let a = bus.register(Registration::new("feed", "data")).await.unwrap();
        let b = bus
            .register(Registration::new("exec", "trading").with_endpoint("http", "http://127.0.0.1:1/in"))
            .await
            .unwrap();
        let mut rx = bus.attach(&b).unwrap();

        let report = bus.send(&b, &a, market_data(), EnvelopeOptions::default()).await.unwrap();
        assert!(report.delivered);
        assert_eq!(report.method, DeliveryMethod::Connection);
        let got = rx.try_recv().unwrap();
        assert_eq!(got.data().unwrap()["symbol"], "BTCUSDT");
        assert_eq!(got.ttl, Some(bus.config().default_ttl_ms));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_detach_sends_to_outbox() {
        let (bus, _) = test_bus();
        let b = bus.register(Registration::new("exec", "trading")).await.unwrap();
        let _rx = bus.attach(&b).unwrap();
        assert_eq!(bus.metrics().connections, 1);
        assert!(bus.detach(&b));
        assert!(!bus.detach(&b));

        let report = bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap();
        assert_eq!(report.method, DeliveryMethod::Queued);
    }

    #[tokio::test]
    async fn test_set_status_publishes_change() {
        let (bus, _) = test_bus();
        let a = bus.register(Registration::new("feed", "data")).await.unwrap();
        let mut events = bus.subscribe();

        bus.set_status(&a, ComponentStatus::Error).unwrap();
        bus.set_status(&a, ComponentStatus::Error).unwrap();
        assert_eq!(bus.component(&a).unwrap().status, ComponentStatus::Error);
        let changes: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(changes.len(), 1);
        assert!(bus.set_status("ghost", ComponentStatus::Active).is_err());
    }

    #[tokio::test]
    async fn test_send_falls_back_to_http_then_surfaces_failure() {
        let (bus, transport) = test_bus();
        let b = bus
            .register(Registration::new("exec", "trading").with_endpoint("http", "http://exec.local/in"))
            .await
            .unwrap();

        let report = bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap();
        assert_eq!(report.method, DeliveryMethod::Http);
        assert_eq!(transport.calls()[0].0, "http://exec.local/in");

        transport.fail(true, true);
        let err = bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::Delivery { .. }));

        // threshold 2: second failure opens the circuit, after which sends queue
        let _ = bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await;
        let report = bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap();
        assert_eq!(report.method, DeliveryMethod::Queued);
        assert_eq!(bus.metrics().outbox_depth, 1);
    }

    #[tokio::test]
    async fn test_queue_then_flush_on_attach() {
        let (bus, _) = test_bus();
        let b = bus.register(Registration::new("exec", "trading")).await.unwrap();
        let mut events = bus.subscribe();

        let report = bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap();
        assert_eq!(report.method, DeliveryMethod::Queued);
        assert!(matches!(events.try_recv().unwrap(), BusEvent::MessageQueued { .. }));

        let mut rx = bus.attach(&b).unwrap();
        assert_eq!(rx.try_recv().unwrap().id, report.envelope_id);
        assert_eq!(bus.metrics().outbox_depth, 0);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let (bus, _) = test_bus();
        let err = bus.send("ghost", "feed", market_data(), EnvelopeOptions::default()).await.unwrap_err();
        assert_eq!(err, CoreError::ComponentNotFound("ghost".into()));
    }

    #[tokio::test]
    async fn test_expired_envelope_dropped_without_error() {
        let (bus, transport) = test_bus();
        let b = bus
            .register(Registration::new("exec", "trading").with_endpoint("http", "http://exec.local/in"))
            .await
            .unwrap();
        let mut env = build_envelope("feed", &b, market_data(), EnvelopeOptions::default().ttl(1));
        env.timestamp -= 10;

        let report = bus.route(&env).await.unwrap();
        assert_eq!(report.method, DeliveryMethod::Dropped);
        assert!(!report.delivered);
        assert!(transport.calls().is_empty());
        assert_eq!(bus.metrics().dropped, 1);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_applies_filter() {
        let (bus, _) = test_bus();
        let sender = bus.register(Registration::new("feed", "analysis")).await.unwrap();
        let a = bus.register(Registration::new("scanner", "analysis")).await.unwrap();
        let b = bus.register(Registration::new("exec", "trading")).await.unwrap();
        let mut sender_rx = bus.attach(&sender).unwrap();
        let mut a_rx = bus.attach(&a).unwrap();
        let mut b_rx = bus.attach(&b).unwrap();
        // join notices
        for rx in [&mut sender_rx, &mut a_rx, &mut b_rx] {
            while rx.try_recv().is_ok() {}
        }

        let report = bus
            .broadcast(
                &sender,
                Payload::event("signal-generated", json!({"side": "buy"})),
                EnvelopeOptions::default(),
                BroadcastFilter::any_of(["analysis"]),
            )
            .await
            .unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.delivered, 1);
        assert!(report.delivered <= report.total);
        assert_eq!(a_rx.try_recv().unwrap().payload.event_name(), Some("signal-generated"));
        assert!(sender_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_collects_failures() {
        let (bus, transport) = test_bus();
        transport.fail(true, false);
        let ok = bus.register(Registration::new("scanner", "analysis")).await.unwrap();
        let _ = bus
            .register(Registration::new("exec", "trading").with_endpoint("http", "http://exec.local/in"))
            .await
            .unwrap();
        let _rx = bus.attach(&ok).unwrap();

        let report = bus
            .broadcast("feed", market_data(), EnvelopeOptions::default(), BroadcastFilter::All)
            .await
            .unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("503"));
    }

    #[tokio::test]
    async fn test_unregister_then_send_fails_and_purges_queue() {
        let (bus, _) = test_bus();
        let b = bus.register(Registration::new("exec", "trading")).await.unwrap();
        bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap();
        assert_eq!(bus.metrics().outbox_depth, 1);

        assert!(bus.unregister(&b).await);
        assert!(!bus.unregister(&b).await);
        assert_eq!(bus.metrics().outbox_depth, 0);
        let err = bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "COMPONENT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_staleness_and_revival() {
        let (bus, _) = test_bus();
        let a = bus.register(Registration::new("feed", "data")).await.unwrap();
        let mut events = bus.subscribe();
        let window = bus.config().staleness_threshold().as_millis() as i64;
        let registered = bus.component(&a).unwrap().last_heartbeat;

        assert!(bus.sweep_stale(registered + window).is_empty());
        assert_eq!(bus.sweep_stale(registered + window + 1), vec![a.clone()]);
        assert_eq!(bus.component(&a).unwrap().status, ComponentStatus::Inactive);

        bus.heartbeat(&a).unwrap();
        assert_eq!(bus.component(&a).unwrap().status, ComponentStatus::Active);
        let changes: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(changes.len(), 2);
        assert!(bus.heartbeat("ghost").is_err());
    }

    #[tokio::test]
    async fn test_retry_delivers_then_exhausts() {
        let (bus, transport) = test_bus();
        let b = bus
            .register(Registration::new("exec", "trading").with_endpoint("http", "http://exec.local/in"))
            .await
            .unwrap();
        let env = build_envelope("feed", &b, market_data(), EnvelopeOptions::default().ttl(60_000));
        bus.enqueue(&b, &env).unwrap();
        assert_eq!(bus.retry_queued().await.unwrap(), 1);
        assert_eq!(bus.metrics().outbox_depth, 0);

        transport.fail(true, true);
        bus.enqueue(&b, &env).unwrap();
        assert_eq!(bus.retry_queued().await.unwrap(), 0);
        assert_eq!(bus.metrics().outbox_depth, 1);
        // max_retries 1: second failed attempt drops it
        assert_eq!(bus.retry_queued().await.unwrap(), 0);
        assert_eq!(bus.metrics().outbox_depth, 0);
        assert_eq!(bus.metrics().dropped, 1);
    }

    #[tokio::test]
    async fn test_interrupted_retry_pass_keeps_envelope_queued() {
        let (bus, transport) = test_bus();
        let bus = Arc::new(bus);
        let b = bus
            .register(Registration::new("exec", "trading").with_endpoint("http", "http://exec.local/in"))
            .await
            .unwrap();
        let env = build_envelope("feed", &b, market_data(), EnvelopeOptions::default().ttl(600_000));
        bus.enqueue(&b, &env).unwrap();
        transport.stall(10_000);

        let pass = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.retry_queued().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pass.abort();
        let _ = pass.await;

        let metrics = bus.metrics();
        assert_eq!(metrics.outbox_depth, 1);
        assert_eq!(metrics.dropped, 0);

        // shutdown hands the lease back so the next process can retry it
        bus.shutdown().await;
        let again = bus.outbox_lock().lease_due(now_ms(), 10, now_ms() + 1_000).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].envelope.id, env.id);
        assert_eq!(again[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_attach_flushes_backlog_ahead_of_live_sends() {
        let (bus, _) = test_bus();
        let b = bus.register(Registration::new("exec", "trading")).await.unwrap();
        let first = bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap();
        let second = bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap();

        let mut rx = bus.attach(&b).unwrap();
        let live = bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap();
        assert_eq!(live.method, DeliveryMethod::Connection);

        let order: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.id).collect();
        assert_eq!(order, vec![first.envelope_id, second.envelope_id, live.envelope_id]);
        assert_eq!(bus.metrics().outbox_depth, 0);
    }

    #[tokio::test]
    async fn test_attach_with_small_channel_keeps_remainder_queued() {
        let config = BusConfig {
            connection_capacity: 1,
            ..BusConfig::default()
        };
        let bus = Bus::with_transport(config, Arc::new(MockTransport::default())).unwrap();
        let b = bus.register(Registration::new("exec", "trading")).await.unwrap();
        for _ in 0..3 {
            bus.send(&b, "feed", market_data(), EnvelopeOptions::default()).await.unwrap();
        }

        let mut rx = bus.attach(&b).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.metrics().outbox_depth, 2);
        // released, so the retry loop can hand them out
        let leased = bus.outbox_lock().lease_for(&b, now_ms(), now_ms() + 1_000).unwrap();
        assert_eq!(leased.len(), 2);
    }

    #[tokio::test]
    async fn test_start_rejects_zero_intervals() {
        let config = BusConfig {
            retry_interval: Duration::ZERO,
            ..BusConfig::default()
        };
        let bus = Arc::new(Bus::new(config).unwrap());
        match bus.start().await.unwrap_err() {
            CoreError::Startup { stage, reason } => {
                assert_eq!(stage, "bus");
                assert!(reason.contains("retry_interval"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let (bus, _) = test_bus();
        let a = bus.register(Registration::new("feed", "data")).await.unwrap();
        bus.shutdown().await;
        let err = bus.send(&a, "x", market_data(), EnvelopeOptions::default()).await.unwrap_err();
        assert_eq!(err, CoreError::ShuttingDown("bus"));
        assert!(bus.register(Registration::new("late", "data")).await.is_err());
    }
}
