use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::reliability::retry::RetryConfig;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// `off`, `none` or an empty value disables a listener.
fn env_addr(key: &str, default: &str) -> Option<SocketAddr> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    match raw.trim().to_lowercase().as_str() {
        "" | "off" | "none" => None,
        addr => addr.parse().ok(),
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// WebSocket listener for persistent component connections.
    pub listen_addr: Option<SocketAddr>,
    pub heartbeat_interval: Duration,
    /// Intervals without a heartbeat before a component is marked inactive.
    pub missed_heartbeats: u32,
    pub default_ttl_ms: u64,
    /// Upper bound for a single HTTP delivery when the envelope has no ttl left to bound it.
    pub http_timeout: Duration,
    /// Per-connection outbound backlog.
    pub connection_capacity: usize,
    /// SQLite path for queued envelopes; `:memory:` keeps the queue in-process.
    pub outbox_path: String,
    pub retry_interval: Duration,
    pub retry: RetryConfig,
    /// Consecutive HTTP failures before an endpoint's circuit opens.
    pub circuit_threshold: u32,
    pub circuit_cooldown: Duration,
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            heartbeat_interval: Duration::from_secs(30),
            missed_heartbeats: 3,
            default_ttl_ms: 30_000,
            http_timeout: Duration::from_secs(10),
            connection_capacity: 256,
            outbox_path: ":memory:".to_string(),
            retry_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(30),
            event_capacity: 1024,
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            listen_addr: env_addr("BUS_ADDR", "127.0.0.1:8780"),
            heartbeat_interval: Duration::from_millis(env_or("HEARTBEAT_MS", 30_000)),
            missed_heartbeats: env_or("MISSED_HEARTBEATS", d.missed_heartbeats),
            default_ttl_ms: env_or("DEFAULT_TTL_MS", d.default_ttl_ms),
            http_timeout: Duration::from_millis(env_or("HTTP_TIMEOUT_MS", 10_000)),
            connection_capacity: env_or("CONN_CHANNEL_CAP", d.connection_capacity),
            outbox_path: std::env::var("OUTBOX_PATH").unwrap_or_else(|_| "./data/outbox.sqlite".to_string()),
            retry_interval: Duration::from_millis(env_or("RETRY_MS", 5_000)),
            retry: RetryConfig {
                max_retries: env_or("RETRY_MAX", d.retry.max_retries),
                ..d.retry
            },
            circuit_threshold: env_or("CIRCUIT_THRESHOLD", d.circuit_threshold),
            circuit_cooldown: Duration::from_millis(env_or("CIRCUIT_COOLDOWN_MS", 30_000)),
            event_capacity: env_or("BUS_EVENT_CAP", d.event_capacity),
        }
    }

    /// Zero periods would make the background tickers panic, so they are
    /// refused before anything is spawned.
    pub fn check_intervals(&self) -> Result<(), String> {
        let periods = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("retry_interval", self.retry_interval),
            ("http_timeout", self.http_timeout),
        ];
        let zero: Vec<&str> = periods.iter().filter(|(_, d)| d.is_zero()).map(|(name, _)| *name).collect();
        if zero.is_empty() {
            Ok(())
        } else {
            Err(format!("must be greater than zero: {}", zero.join(", ")))
        }
    }

    /// Silence window after which a component counts as stale.
    pub fn staleness_threshold(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct StateConfig {
    pub lock_timeout: Duration,
    pub history_limit: usize,
    pub snapshot_dir: PathBuf,
    /// Zero disables the periodic snapshot timer (shutdown still snapshots).
    pub snapshot_interval: Duration,
    pub snapshot_retention: usize,
    /// Directory of `<componentType>.json` schemas loaded at start.
    pub schema_dir: Option<PathBuf>,
    /// Numeric data keys copied into the global projection.
    pub projected_metrics: Vec<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            history_limit: 50,
            snapshot_dir: PathBuf::from("./data/snapshots"),
            snapshot_interval: Duration::from_secs(60),
            snapshot_retention: 10,
            schema_dir: None,
            projected_metrics: ["pnl", "equity", "health", "score", "latencyMs", "errorCount"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl StateConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            lock_timeout: Duration::from_millis(env_or("LOCK_TIMEOUT_MS", 5_000)),
            history_limit: env_or("HISTORY_LIMIT", d.history_limit),
            snapshot_dir: std::env::var("SNAPSHOT_DIR").map(PathBuf::from).unwrap_or(d.snapshot_dir),
            snapshot_interval: Duration::from_secs(env_or("SNAPSHOT_SECS", 60)),
            snapshot_retention: env_or("SNAPSHOT_KEEP", d.snapshot_retention),
            schema_dir: std::env::var("SCHEMA_DIR").ok().map(PathBuf::from),
            projected_metrics: std::env::var("PROJECTED_METRICS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(d.projected_metrics),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// HTTP health/metrics/request-transport surface.
    pub gateway_addr: Option<SocketAddr>,
    pub startup_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gateway_addr: None,
            startup_timeout: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_addr: env_addr("GATEWAY_ADDR", "127.0.0.1:8781"),
            startup_timeout: Duration::from_millis(env_or("STARTUP_TIMEOUT_MS", 30_000)),
        }
    }
}

/// Whole-process configuration. `Default` is listener-free and in-memory,
/// which is what tests build on; `from_env` is what the binary uses.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub bus: BusConfig,
    pub state: StateConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bus: BusConfig::from_env(),
            state: StateConfig::from_env(),
            orchestrator: OrchestratorConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_threshold() {
        let cfg = BusConfig {
            heartbeat_interval: Duration::from_millis(100),
            missed_heartbeats: 3,
            ..Default::default()
        };
        assert_eq!(cfg.staleness_threshold(), Duration::from_millis(300));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        assert!(BusConfig::default().check_intervals().is_ok());
        let cfg = BusConfig {
            heartbeat_interval: Duration::ZERO,
            retry_interval: Duration::ZERO,
            ..Default::default()
        };
        let err = cfg.check_intervals().unwrap_err();
        assert!(err.contains("heartbeat_interval"));
        assert!(err.contains("retry_interval"));
        assert!(!err.contains("http_timeout"));
    }

    #[test]
    fn test_defaults_are_listener_free() {
        let cfg = Config::default();
        assert!(cfg.bus.listen_addr.is_none());
        assert!(cfg.orchestrator.gateway_addr.is_none());
        assert_eq!(cfg.bus.outbox_path, ":memory:");
    }
}
