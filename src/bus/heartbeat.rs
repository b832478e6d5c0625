use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use super::Bus;
use crate::logging::{log, log_persistence_error, obj, v_str, Domain, Level};
use crate::now_ms;

/// Every heartbeat interval: mark silent components inactive, then beacon.
pub(crate) async fn heartbeat_loop(bus: Arc<Bus>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(bus.config().heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stale = bus.sweep_stale(now_ms());
                if !stale.is_empty() {
                    log(
                        Level::Warn,
                        Domain::Bus,
                        "components_stale",
                        obj(&[("ids", v_str(&stale.join(",")))]),
                    );
                }
                bus.emit_heartbeat().await;
            }
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

/// Drains the outbox on a fixed cadence; per-entry backoff decides what is due.
pub(crate) async fn retry_loop(bus: Arc<Bus>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(bus.config().retry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = bus.retry_queued().await {
                    log_persistence_error("outbox_retry", &e.to_string());
                }
            }
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ComponentStatus;
    use crate::config::BusConfig;
    use crate::contract::Registration;
    use std::time::Duration;

    #[tokio::test]
    async fn test_loop_marks_silent_component_inactive_and_stops() {
        let config = BusConfig {
            heartbeat_interval: Duration::from_millis(20),
            missed_heartbeats: 1,
            ..BusConfig::default()
        };
        let bus = Arc::new(Bus::new(config).unwrap());
        let id = bus.register(Registration::new("feed", "data")).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(heartbeat_loop(bus.clone(), rx));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(bus.component(&id).unwrap().status, ComponentStatus::Inactive);
        assert!(bus.metrics().broadcasts >= 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
