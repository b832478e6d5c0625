use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::contract::Registration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Registering,
    Active,
    Inactive,
    Error,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Registering => "registering",
            ComponentStatus::Active => "active",
            ComponentStatus::Inactive => "inactive",
            ComponentStatus::Error => "error",
        }
    }
}

/// Registry entry for one connected service process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub endpoints: BTreeMap<String, String>,
    pub capabilities: BTreeSet<String>,
    pub dependencies: Vec<String>,
    pub metadata: Map<String, Value>,
    pub status: ComponentStatus,
    pub registered_at: i64,
    pub last_heartbeat: i64,
}

impl Component {
    pub fn from_registration(id: String, reg: Registration, now_ms: i64) -> Self {
        Self {
            id,
            name: reg.name,
            kind: reg.kind,
            version: reg.version.unwrap_or_else(|| "0.0.0".to_string()),
            endpoints: reg.endpoints,
            capabilities: reg.capabilities,
            dependencies: reg.dependencies,
            metadata: reg.metadata,
            status: ComponentStatus::Active,
            registered_at: now_ms,
            last_heartbeat: now_ms,
        }
    }

    /// Re-registration under the same id: keep identity and `registered_at`.
    pub fn refresh(&mut self, reg: Registration, now_ms: i64) {
        let registered_at = self.registered_at;
        *self = Self::from_registration(self.id.clone(), reg, now_ms);
        self.registered_at = registered_at;
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn http_endpoint(&self) -> Option<&str> {
        self.endpoints
            .get("http")
            .or_else(|| self.endpoints.get("https"))
            .map(String::as_str)
    }

    pub fn is_stale(&self, now_ms: i64, threshold_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat) > threshold_ms
    }
}

/// Recipient selection for broadcasts.
#[derive(Clone, Default)]
pub enum BroadcastFilter {
    #[default]
    All,
    /// Case-insensitive substring of the component's type or name.
    Match(String),
    /// Any of the substrings matches.
    AnyOf(Vec<String>),
    /// Component advertises the capability.
    Capability(String),
    Predicate(Arc<dyn Fn(&Component) -> bool + Send + Sync>),
}

impl BroadcastFilter {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Component) -> bool + Send + Sync + 'static,
    {
        BroadcastFilter::Predicate(Arc::new(f))
    }

    pub fn any_of<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BroadcastFilter::AnyOf(needles.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, component: &Component) -> bool {
        fn hit(component: &Component, needle: &str) -> bool {
            let needle = needle.to_lowercase();
            component.kind.to_lowercase().contains(&needle) || component.name.to_lowercase().contains(&needle)
        }
        match self {
            BroadcastFilter::All => true,
            BroadcastFilter::Match(needle) => hit(component, needle),
            BroadcastFilter::AnyOf(needles) => needles.iter().any(|n| hit(component, n)),
            BroadcastFilter::Capability(cap) => component.has_capability(cap),
            BroadcastFilter::Predicate(f) => f(component),
        }
    }
}

impl std::fmt::Debug for BroadcastFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastFilter::All => write!(f, "All"),
            BroadcastFilter::Match(s) => write!(f, "Match({:?})", s),
            BroadcastFilter::AnyOf(v) => write!(f, "AnyOf({:?})", v),
            BroadcastFilter::Capability(c) => write!(f, "Capability({:?})", c),
            BroadcastFilter::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

impl From<&str> for BroadcastFilter {
    fn from(s: &str) -> Self {
        BroadcastFilter::Match(s.to_string())
    }
}

impl From<Vec<String>> for BroadcastFilter {
    fn from(v: Vec<String>) -> Self {
        BroadcastFilter::AnyOf(v)
    }
}
