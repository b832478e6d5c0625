//! Top-level facade: startup sequencing, validated operations, health and
//! graceful shutdown.
//!
//! Startup order is bus, state store, then the optional HTTP gateway.
//! Shutdown runs the reverse.

pub mod gateway;

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::bus::{BroadcastFilter, BroadcastReport, Bus, BusMetrics, Component, SendReport};
use crate::config::Config;
use crate::contract::taxonomy::events;
use crate::contract::{
    build_envelope, check_envelope, Envelope, EnvelopeOptions, MessageKind, Payload, Registration, StateOp,
};
use crate::error::{CoreError, CoreResult};
use crate::logging::{log, obj, v_str, Domain, Level, ProfileScope};
use crate::state::{
    Projection, ReadOptions, StateMetrics, StateStore, UpdateOptions, STATE_STORE_ID,
};

use gateway::GatewayHandle;

/// Sender id on envelopes the orchestrator originates.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

const LIFECYCLE_NOTICE_TTL_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Initializing,
    Ready,
    Error,
    ShuttingDown,
    Shutdown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::Ready => "ready",
            Phase::Error => "error",
            Phase::ShuttingDown => "shutting-down",
            Phase::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemStatus {
    Pending,
    Running,
    Stopped,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsystemHealth {
    pub bus: SubsystemStatus,
    pub state_store: SubsystemStatus,
    pub gateway: SubsystemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    /// Milliseconds since the orchestrator became ready.
    pub uptime: u64,
    pub components_registered: usize,
    pub messages_processed: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    /// `healthy`, `degraded`, or the phase name outside `ready`.
    pub status: String,
    pub components: SubsystemHealth,
    pub metrics: HealthMetrics,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorMetrics {
    pub phase: Phase,
    pub uptime_ms: u64,
    pub errors: u64,
    pub bus: BusMetrics,
    pub state: StateMetrics,
    pub components: Vec<Component>,
}

pub struct Orchestrator {
    config: Config,
    bus: Arc<Bus>,
    state: Arc<StateStore>,
    phase: RwLock<Phase>,
    stage: Mutex<&'static str>,
    gateway: Mutex<Option<GatewayHandle>>,
    ready_at: Mutex<Option<Instant>>,
    errors: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: Config) -> CoreResult<Self> {
        let bus = Arc::new(Bus::new(config.bus.clone())?);
        Ok(Self::with_bus(config, bus))
    }

    /// Build around an existing bus (custom transport in tests, for one).
    pub fn with_bus(config: Config, bus: Arc<Bus>) -> Self {
        let state = Arc::new(StateStore::new(config.state.clone(), Arc::clone(&bus)));
        Self {
            config,
            bus,
            state,
            phase: RwLock::new(Phase::Initializing),
            stage: Mutex::new("contract"),
            gateway: Mutex::new(None),
            ready_at: Mutex::new(None),
            errors: AtomicU64::new(0),
        }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        *self.phase.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, next: Phase) {
        let previous = std::mem::replace(&mut *self.phase.write().unwrap_or_else(|e| e.into_inner()), next);
        if previous != next {
            log(
                Level::Info,
                Domain::Orchestrator,
                "phase_changed",
                obj(&[("from", v_str(previous.as_str())), ("to", v_str(next.as_str()))]),
            );
        }
    }

    fn set_stage(&self, stage: &'static str) {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner()) = stage;
    }

    fn current_stage(&self) -> &'static str {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.gateway
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|g| g.addr())
    }

    pub fn bus_addr(&self) -> Option<SocketAddr> {
        self.bus.local_addr()
    }

    fn uptime_ms(&self) -> u64 {
        self.ready_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    fn ensure_accepting(&self) -> CoreResult<()> {
        match self.phase() {
            Phase::ShuttingDown | Phase::Shutdown => Err(CoreError::ShuttingDown("orchestrator")),
            _ => Ok(()),
        }
    }

    /// Count failures for the health surface.
    fn track<T>(&self, result: CoreResult<T>) -> CoreResult<T> {
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run every startup stage within `startup_timeout`. Any failure moves
    /// the orchestrator to `error` and stops what already started.
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        let phase = self.phase();
        if phase != Phase::Initializing {
            return Err(CoreError::Startup {
                stage: "orchestrator".to_string(),
                reason: format!("cannot start from phase {}", phase.as_str()),
            });
        }
        let _profile = ProfileScope::new("orchestrator_startup");
        let budget = self.config.orchestrator.startup_timeout;
        let outcome = match tokio::time::timeout(budget, self.run_stages()).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Startup {
                stage: self.current_stage().to_string(),
                reason: format!("timed out after {}ms", budget.as_millis()),
            }),
        };

        match outcome {
            Ok(()) => {
                *self.ready_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
                self.set_phase(Phase::Ready);
                self.announce(events::SYSTEM_READY, json!({ "phase": Phase::Ready })).await;
                log(
                    Level::Info,
                    Domain::Orchestrator,
                    "system_ready",
                    obj(&[
                        ("bus_addr", self.bus_addr().map(|a| v_str(&a.to_string())).unwrap_or(Value::Null)),
                        ("gateway_addr", self.gateway_addr().map(|a| v_str(&a.to_string())).unwrap_or(Value::Null)),
                        ("components", json!(self.state.len())),
                    ]),
                );
                Ok(())
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                log(
                    Level::Error,
                    Domain::Orchestrator,
                    "startup_failed",
                    obj(&[("stage", v_str(self.current_stage())), ("error", v_str(&e.to_string()))]),
                );
                self.set_phase(Phase::Error);
                self.stop_gateway().await;
                self.state.halt().await;
                self.bus.shutdown().await;
                Err(e)
            }
        }
    }

    async fn run_stages(self: &Arc<Self>) -> CoreResult<()> {
        self.set_stage("bus");
        self.bus.start().await?;

        self.set_stage("state");
        self.state.start().await?;

        if let Some(addr) = self.config.orchestrator.gateway_addr {
            self.set_stage("gateway");
            let handle = gateway::spawn(Arc::clone(self), addr).await?;
            *self.gateway.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }
        self.set_stage("ready");
        Ok(())
    }

    /// Lifecycle event to every registered component. A failed notice is
    /// logged and never blocks the transition.
    async fn announce(&self, event: &str, data: Value) {
        let notice = self
            .bus
            .broadcast(
                ORCHESTRATOR_ID,
                Payload::event(event, data),
                EnvelopeOptions::default().ttl(LIFECYCLE_NOTICE_TTL_MS),
                BroadcastFilter::All,
            )
            .await;
        if let Err(e) = notice {
            log(
                Level::Warn,
                Domain::Orchestrator,
                "lifecycle_notice_failed",
                obj(&[("event", v_str(event)), ("error", v_str(&e.to_string()))]),
            );
        }
    }

    async fn stop_gateway(&self) {
        let handle = self.gateway.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Reverse-order shutdown: gateway, state store (drain and final
    /// snapshot), then the bus. Idempotent.
    pub async fn shutdown(&self) -> CoreResult<()> {
        {
            let mut phase = self.phase.write().unwrap_or_else(|e| e.into_inner());
            if matches!(*phase, Phase::ShuttingDown | Phase::Shutdown) {
                return Ok(());
            }
            *phase = Phase::ShuttingDown;
        }
        log(Level::Info, Domain::Orchestrator, "shutdown_started", obj(&[]));
        let _profile = ProfileScope::new("orchestrator_shutdown");

        if !self.bus.is_closing() {
            self.announce(events::SYSTEM_SHUTDOWN, json!({})).await;
        }

        self.stop_gateway().await;
        let final_snapshot = self.state.shutdown().await;
        self.bus.shutdown().await;
        self.set_phase(Phase::Shutdown);
        log(
            Level::Info,
            Domain::Orchestrator,
            "shutdown_complete",
            obj(&[("final_snapshot", json!(final_snapshot.is_ok()))]),
        );
        self.track(final_snapshot)
    }

    // =========================================================================
    // Components and messages
    // =========================================================================

    /// Register a component and seed its default state.
    pub async fn register_component(&self, registration: Registration) -> CoreResult<String> {
        let result = self.register_inner(registration).await;
        self.track(result)
    }

    async fn register_inner(&self, registration: Registration) -> CoreResult<String> {
        self.ensure_accepting()?;
        let id = self.bus.register(registration).await?;
        self.state.read(&id, ReadOptions::create()).await?;
        Ok(id)
    }

    /// Register from a raw `register` envelope, or from a bare registration
    /// payload `{name, type, ...}`.
    pub async fn register_frame(&self, raw: &Value) -> CoreResult<String> {
        let result = async {
            let frame = if raw.get("payload").is_some() {
                raw.clone()
            } else {
                json!({ "type": MessageKind::Register.as_str(), "payload": raw })
            };
            let envelope = Envelope::parse(&frame)?;
            match envelope.payload {
                Payload::Register(registration) => self.register_inner(registration).await,
                other => Err(CoreError::invalid(
                    "type",
                    format!("expected 'register', got '{}'", other.kind().as_str()),
                )),
            }
        }
        .await;
        self.track(result)
    }

    pub async fn unregister_component(&self, component_id: &str) -> CoreResult<()> {
        let result = async {
            self.ensure_accepting()?;
            if self.bus.unregister(component_id).await {
                Ok(())
            } else {
                Err(CoreError::ComponentNotFound(component_id.to_string()))
            }
        }
        .await;
        self.track(result)
    }

    pub fn components(&self) -> Vec<Component> {
        self.bus.components()
    }

    /// Explicit liveness beacon for components without a persistent connection.
    pub fn heartbeat(&self, component_id: &str) -> CoreResult<()> {
        let result = self.ensure_accepting().and_then(|()| self.bus.heartbeat(component_id));
        self.track(result)
    }

    /// Build, validate and route a message to `target` (or `broadcast`).
    pub async fn send_message(
        &self,
        from: &str,
        target: &str,
        payload: Payload,
        options: EnvelopeOptions,
    ) -> CoreResult<SendReport> {
        let result = async {
            self.ensure_accepting()?;
            self.bus.send(target, from, payload, options).await
        }
        .await;
        self.track(result)
    }

    /// Validate and route a raw envelope received over a request transport.
    /// A registered sender counts the frame as proof of liveness.
    pub async fn route_frame(&self, raw: &Value) -> CoreResult<SendReport> {
        let result = async {
            self.ensure_accepting()?;
            let envelope = Envelope::parse(raw)?;
            if envelope.kind() == MessageKind::Register {
                return Err(CoreError::invalid("type", "register frames go to /register"));
            }
            self.bus.note_received();
            // senders outside the registry are allowed
            let _ = self.bus.heartbeat(&envelope.from);
            self.bus.route(&envelope).await
        }
        .await;
        self.track(result)
    }

    pub async fn broadcast_message(
        &self,
        from: &str,
        payload: Payload,
        options: EnvelopeOptions,
        filter: BroadcastFilter,
    ) -> CoreResult<BroadcastReport> {
        let result = async {
            self.ensure_accepting()?;
            self.bus.broadcast(from, payload, options, filter).await
        }
        .await;
        self.track(result)
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Validate `patch` as a state-update envelope, then merge it.
    pub async fn update_component_state(
        &self,
        component_id: &str,
        patch: Value,
        options: UpdateOptions,
    ) -> CoreResult<Value> {
        let result = async {
            self.ensure_accepting()?;
            let envelope = build_envelope(
                component_id,
                STATE_STORE_ID,
                Payload::state(StateOp::Update, patch, 0),
                EnvelopeOptions::default(),
            );
            check_envelope(&envelope)?;
            let Payload::State(update) = envelope.payload else {
                return Err(CoreError::invalid("payload", "expected state payload"));
            };
            self.state.update(component_id, update.state_data, options).await
        }
        .await;
        self.track(result)
    }

    /// State for a component; registered components get their seed on first read.
    pub async fn get_component_state(&self, component_id: &str) -> CoreResult<Value> {
        let result = async {
            let options = ReadOptions {
                create_if_not_exists: self.bus.is_registered(component_id) && !self.state.is_closing(),
            };
            self.state
                .read(component_id, options)
                .await?
                .ok_or_else(|| CoreError::ComponentNotFound(component_id.to_string()))
        }
        .await;
        self.track(result)
    }

    pub fn get_global_state(&self) -> BTreeMap<String, Projection> {
        self.state.global_state()
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub fn get_metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            phase: self.phase(),
            uptime_ms: self.uptime_ms(),
            errors: self.errors.load(Ordering::Relaxed),
            bus: self.bus.metrics(),
            state: self.state.metrics(),
            components: self.bus.components(),
        }
    }

    pub fn get_health(&self) -> Health {
        let phase = self.phase();
        let subsystem = |closing: bool| match (phase, closing) {
            (_, true) => SubsystemStatus::Stopped,
            (Phase::Initializing, false) => SubsystemStatus::Pending,
            _ => SubsystemStatus::Running,
        };
        let gateway = if self.config.orchestrator.gateway_addr.is_none() {
            SubsystemStatus::Disabled
        } else if self.gateway_addr().is_some() {
            SubsystemStatus::Running
        } else if phase == Phase::Initializing {
            SubsystemStatus::Pending
        } else {
            SubsystemStatus::Stopped
        };
        let components = SubsystemHealth {
            bus: subsystem(self.bus.is_closing()),
            state_store: subsystem(self.state.is_closing()),
            gateway,
        };

        let all_up = [components.bus, components.state_store, components.gateway]
            .iter()
            .all(|s| matches!(s, SubsystemStatus::Running | SubsystemStatus::Disabled));
        let status = match phase {
            Phase::Ready if all_up => "healthy",
            Phase::Ready => "degraded",
            other => other.as_str(),
        };

        let bus = self.bus.metrics();
        Health {
            status: status.to_string(),
            components,
            metrics: HealthMetrics {
                uptime: self.uptime_ms(),
                components_registered: bus.components,
                messages_processed: bus.sent + bus.received,
                errors: self.errors.load(Ordering::Relaxed),
            },
        }
    }
}
