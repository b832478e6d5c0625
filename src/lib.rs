//! Inter-component message bus and shared-state substrate.
//!
//! Components register with the [`bus::Bus`], exchange typed envelopes
//! validated by [`contract`], and keep their state in the
//! [`state::StateStore`]. The [`orchestrator::Orchestrator`] wires the three
//! together and owns startup and shutdown.

pub mod bus;
pub mod config;
pub mod contract;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod reliability;
pub mod state;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use orchestrator::Orchestrator;

/// Wall clock in epoch milliseconds; every envelope and state timestamp uses it.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
