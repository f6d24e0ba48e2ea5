#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Minimal per-error-class circuit breaker.
///
/// Failure counters are tracked per class; crossing the threshold in any
/// single class opens the circuit. Only the worker main loop touches the
/// breaker, so no interior locking is needed.
#[derive(Debug)]
pub struct CircuitBreaker {
    pub threshold: u32,
    pub cooldown: Duration,

    state: CircuitState,
    failures: HashMap<String, u32>,
    opened_at: Option<Instant>,
    opened_class: String,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: if threshold == 0 { 5 } else { threshold },
            cooldown: if cooldown.is_zero() {
                Duration::from_secs(30)
            } else {
                cooldown
            },
            state: CircuitState::Closed,
            failures: HashMap::new(),
            opened_at: None,
            opened_class: String::new(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether new work is allowed at this instant. An expired cooldown
    /// moves the breaker to half-open and admits one probe.
    pub fn allow(&mut self, now: Instant) -> bool {
        if self.state != CircuitState::Open {
            return true;
        }
        match self.opened_at {
            Some(opened) if now.saturating_duration_since(opened) >= self.cooldown => {
                self.state = CircuitState::HalfOpen;
                true
            }
            _ => false,
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_class.clear();
        self.failures.clear();
    }

    /// A failure in half-open re-opens immediately with the fresh timestamp.
    pub fn record_failure(&mut self, error_class: &str, now: Instant) {
        let class = if error_class.is_empty() {
            "unknown"
        } else {
            error_class
        };
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
            self.opened_class = class.to_string();
            return;
        }
        let count = self.failures.entry(class.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
            self.opened_class = class.to_string();
        }
    }

    pub fn opened_class(&self) -> &str {
        &self.opened_class
    }
}
