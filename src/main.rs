use anyhow::{Context, Result};
use corebus::logging::{log, obj, v_str, Domain, Level};
use corebus::{Config, Orchestrator};
use serde_json::{json, Value};
use std::sync::Arc;

fn addr_field(addr: Option<std::net::SocketAddr>) -> Value {
    addr.map(|a| v_str(&a.to_string())).unwrap_or(Value::Null)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    log(
        Level::Info,
        Domain::System,
        "config_loaded",
        obj(&[
            ("bus_addr", addr_field(cfg.bus.listen_addr)),
            ("gateway_addr", addr_field(cfg.orchestrator.gateway_addr)),
            ("outbox_path", v_str(&cfg.bus.outbox_path)),
            ("snapshot_dir", v_str(&cfg.state.snapshot_dir.display().to_string())),
            ("heartbeat_ms", json!(cfg.bus.heartbeat_interval.as_millis() as u64)),
        ]),
    );

    let orchestrator = Arc::new(Orchestrator::new(cfg).context("building orchestrator")?);
    orchestrator.start().await.context("starting orchestrator")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    log(Level::Info, Domain::System, "signal_received", obj(&[("signal", v_str("ctrl-c"))]));

    orchestrator.shutdown().await.context("shutting down")?;
    Ok(())
}
