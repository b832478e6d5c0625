use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};

/// One committed mutation, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub previous: Value,
    pub next: Value,
    pub timestamp: i64,
}

/// State document owned by one component, plus commit bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentState {
    pub component_id: String,
    pub data: Value,
    pub version: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
}

impl ComponentState {
    /// Default state for a component that has never published anything.
    pub fn seed(component_id: &str, now_ms: i64) -> Self {
        Self {
            component_id: component_id.to_string(),
            data: json!({
                "id": component_id,
                "status": "initialized",
                "timestamp": now_ms,
                "data": {},
            }),
            version: 1,
            timestamp: now_ms,
            history: VecDeque::new(),
        }
    }

    pub fn status(&self) -> &str {
        self.data.get("status").and_then(Value::as_str).unwrap_or("unknown")
    }

    /// Replace the document, bumping the version and recording history.
    pub fn commit(&mut self, next: Value, now_ms: i64, history_limit: usize) {
        let previous = std::mem::replace(&mut self.data, next);
        if history_limit > 0 {
            self.history.push_back(HistoryEntry {
                previous,
                next: self.data.clone(),
                timestamp: now_ms,
            });
            while self.history.len() > history_limit {
                self.history.pop_front();
            }
        }
        self.version += 1;
        self.timestamp = now_ms;
    }

    /// Top-level value for `key`, falling back to the nested `data` object.
    fn lookup(&self, key: &str) -> Option<&Value> {
        self.data
            .get(key)
            .or_else(|| self.data.get("data").and_then(|d| d.get(key)))
    }
}

/// Summary of one component in the global state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub status: String,
    pub last_update: i64,
    pub version: u64,
    pub metrics: BTreeMap<String, Value>,
}

impl Projection {
    pub fn of(state: &ComponentState, metric_keys: &[String]) -> Self {
        let metrics = metric_keys
            .iter()
            .filter_map(|k| {
                state
                    .lookup(k)
                    .filter(|v| v.is_number())
                    .map(|v| (k.clone(), v.clone()))
            })
            .collect();
        Self {
            status: state.status().to_string(),
            last_update: state.timestamp,
            version: state.version,
            metrics,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetrics {
    pub updates: u64,
    pub validation_failures: u64,
    pub lock_timeouts: u64,
    pub snapshots: u64,
    pub snapshot_failures: u64,
    pub synchronizations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateQuery {
    Component(String),
    ComponentType(String),
    All,
}
