//! Structured logging for the bus and state substrate.
//!
//! Every record is one JSON line carrying:
//! 1. a run id and a process-wide sequence number (replay ordering)
//! 2. a level (TRACE → FATAL) and a domain for filtering
//! 3. routing keys hoisted to the top level (`component_id`, `envelope_id`, `corr_id`)
//! 4. everything else under `data`
//!
//! Records go to stdout and, when the run directory can be created, to
//! `events.jsonl` / `trace.jsonl` under `LOG_DIR/<run_id>`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Bus,          // Registration, routing, delivery
    Contract,     // Envelope and schema validation
    State,        // Merges, locks, projections
    Persist,      // Snapshots and outbox
    Orchestrator, // Lifecycle and startup sequencing
    Gateway,      // HTTP surface
    System,       // Process startup, shutdown
    Profile,      // Performance profiling
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Bus => "bus",
            Domain::Contract => "contract",
            Domain::State => "state",
            Domain::Persist => "persist",
            Domain::Orchestrator => "orchestrator",
            Domain::Gateway => "gateway",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
            return RunContext {
                run_id,
                events: None,
                trace: None,
            };
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "api_key", "apiKey", "token", "secret"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["component_id", "envelope_id", "corr_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    println!("{}", line);
}

// =============================================================================
// Bus logs
// =============================================================================

pub fn log_component_registered(component_id: &str, name: &str, kind: &str, reregistered: bool) {
    log(
        Level::Info,
        Domain::Bus,
        "component_registered",
        obj(&[
            ("component_id", v_str(component_id)),
            ("name", v_str(name)),
            ("type", v_str(kind)),
            ("reregistered", Value::Bool(reregistered)),
        ]),
    );
}

pub fn log_component_unregistered(component_id: &str) {
    log(
        Level::Info,
        Domain::Bus,
        "component_unregistered",
        obj(&[("component_id", v_str(component_id))]),
    );
}

pub fn log_status_change(component_id: &str, from: &str, to: &str) {
    log(
        Level::Warn,
        Domain::Bus,
        "status_change",
        obj(&[
            ("component_id", v_str(component_id)),
            ("from", v_str(from)),
            ("to", v_str(to)),
        ]),
    );
}

/// One delivery attempt. `error` is set when the attempt failed.
pub fn log_delivery(envelope_id: &str, target: &str, method: &str, error: Option<&str>) {
    let level = if error.is_some() { Level::Warn } else { Level::Debug };
    log(
        level,
        Domain::Bus,
        "delivery",
        obj(&[
            ("envelope_id", v_str(envelope_id)),
            ("component_id", v_str(target)),
            ("method", v_str(method)),
            ("error", error.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_broadcast(envelope_id: &str, delivered: usize, total: usize, failures: usize) {
    log(
        Level::Debug,
        Domain::Bus,
        "broadcast",
        obj(&[
            ("envelope_id", v_str(envelope_id)),
            ("delivered", json!(delivered)),
            ("total", json!(total)),
            ("failures", json!(failures)),
        ]),
    );
}

// =============================================================================
// Contract logs
// =============================================================================

pub fn log_validation_failure(subject: &str, violations: &[String]) {
    log(
        Level::Warn,
        Domain::Contract,
        "validation_failed",
        obj(&[
            ("subject", v_str(subject)),
            (
                "violations",
                Value::Array(violations.iter().map(|v| v_str(v)).collect()),
            ),
        ]),
    );
}

// =============================================================================
// State logs
// =============================================================================

pub fn log_state_commit(component_id: &str, version: u64, keys: usize, global: bool) {
    log(
        Level::Debug,
        Domain::State,
        "commit",
        obj(&[
            ("component_id", v_str(component_id)),
            ("version", json!(version)),
            ("keys", json!(keys)),
            ("global", Value::Bool(global)),
        ]),
    );
}

pub fn log_lock_timeout(component_id: &str, waited_ms: u64) {
    log(
        Level::Error,
        Domain::State,
        "lock_timeout",
        obj(&[
            ("component_id", v_str(component_id)),
            ("waited_ms", json!(waited_ms)),
        ]),
    );
}

// =============================================================================
// Persistence logs
// =============================================================================

pub fn log_snapshot(path: &str, components: usize, bytes: usize, pruned: usize) {
    log(
        Level::Info,
        Domain::Persist,
        "snapshot_written",
        obj(&[
            ("path", v_str(path)),
            ("components", json!(components)),
            ("bytes", json!(bytes)),
            ("pruned", json!(pruned)),
        ]),
    );
}

pub fn log_persistence_error(operation: &str, error: &str) {
    log(
        Level::Error,
        Domain::Persist,
        "persistence_error",
        obj(&[("operation", v_str(operation)), ("error", v_str(error))]),
    );
}

// =============================================================================
// Helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            context: None,
            started: Instant::now(),
            enabled: Self::should_sample(),
        }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Tests
// =============================================================================
