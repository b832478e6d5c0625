use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure breaker for one delivery endpoint.
///
/// Open circuits reject calls until `cooldown` has elapsed, then allow a
/// single probe (half-open). A successful probe closes the circuit, a failed
/// one re-opens it for another cooldown.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            cooldown,
            opened_at: None,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        if self.state == CircuitState::HalfOpen || self.failures >= self.threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
        }
    }

    /// Whether a call may go through now. Moves an expired open circuit to half-open.
    pub fn allow(&mut self) -> bool {
        if self.state == CircuitState::Open {
            let cooled = self
                .opened_at
                .map(|at| at.elapsed() >= self.cooldown)
                .unwrap_or(true);
            if cooled {
                self.state = CircuitState::HalfOpen;
            }
        }
        matches!(self.state, CircuitState::Closed | CircuitState::HalfOpen)
    }
}
