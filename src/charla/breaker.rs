//! Per-tool circuit breakers.
//!
//! The registry owns one breaker per tool name behind narrow operations:
//! [`CircuitBreakerRegistry::should_allow`], [`record_success`] and
//! [`record_failure`]. The map itself is never exposed, and the lock is
//! only held for the few instructions of each operation, never across I/O.
//!
//! State machine per tool: *closed* counts consecutive failures; when the
//! count reaches the manifest threshold the breaker *opens* and calls are
//! skipped. After the cooldown the next permission check admits a single
//! *half-open* probe: success closes the breaker, failure re-opens it with
//! a fresh cooldown.
//!
//! [`record_success`]: CircuitBreakerRegistry::record_success
//! [`record_failure`]: CircuitBreakerRegistry::record_failure

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::charla::manifest::CircuitPolicy;

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Process-wide registry of per-tool breakers.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a call to `tool` may proceed right now.
    ///
    /// An open breaker past its cooldown flips to half-open and admits this
    /// single probe; further calls are refused until the probe concludes.
    pub fn should_allow(&self, tool: &str, policy: &CircuitPolicy) -> bool {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(tool.to_string())
            .or_insert_with(Breaker::new);
        match breaker.state {
            State::Closed => true,
            State::HalfOpen => false,
            State::Open => {
                let cooled_down = breaker
                    .opened_at
                    .map(|at| at.elapsed().as_millis() as u64 >= policy.cooldown_ms)
                    .unwrap_or(true);
                if cooled_down {
                    breaker.state = State::HalfOpen;
                    log::info!("breaker for '{}' half-open, admitting probe", tool);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: the breaker closes and the failure count
    /// resets.
    pub fn record_success(&self, tool: &str) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(tool.to_string())
            .or_insert_with(Breaker::new);
        if breaker.state != State::Closed {
            log::info!("breaker for '{}' closed after successful probe", tool);
        }
        breaker.state = State::Closed;
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
    }

    /// Record a terminal failure. A failed half-open probe re-opens the
    /// breaker with a fresh cooldown; otherwise the consecutive-failure
    /// count grows and opens the breaker at the threshold.
    pub fn record_failure(&self, tool: &str, policy: &CircuitPolicy) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(tool.to_string())
            .or_insert_with(Breaker::new);
        match breaker.state {
            State::HalfOpen => {
                breaker.state = State::Open;
                breaker.opened_at = Some(Instant::now());
                log::warn!("breaker for '{}' re-opened after failed probe", tool);
            }
            _ => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= policy.threshold {
                    breaker.state = State::Open;
                    breaker.opened_at = Some(Instant::now());
                    log::warn!(
                        "breaker for '{}' opened after {} consecutive failures",
                        tool,
                        breaker.consecutive_failures
                    );
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Breaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
