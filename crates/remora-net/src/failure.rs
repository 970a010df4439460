//! Failure-detection policies.
//!
//! A policy decides when a stream of recent failures should mark a
//! node dead. The node stays in the topology either way; dead nodes
//! are only excluded from routing until a resurrection probe succeeds.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-node failure policy.
///
/// `record_failure` is called on every failed operation against the
/// node and returns true when the node should be marked dead.
/// `reset` clears accumulated state after the node recovers.
pub trait FailurePolicy: Send + Sync + fmt::Debug {
    /// Record one failure; true means "mark the node dead now".
    fn record_failure(&self) -> bool;
    /// Forget accumulated failures (node recovered).
    fn reset(&self);
}

/// Marks the node dead on the first failure.
#[derive(Debug, Default)]
pub struct FailFast;

impl FailurePolicy for FailFast {
    fn record_failure(&self) -> bool {
        true
    }

    fn reset(&self) {}
}

/// Marks the node dead once `max_failures` failures land inside a
/// sliding time window. Isolated hiccups are tolerated; sustained
/// failure is not.
#[derive(Debug)]
pub struct WindowThrottle {
    max_failures: usize,
    window: Duration,
    failures: Mutex<VecDeque<Instant>>,
}

impl WindowThrottle {
    /// Policy that trips after `max_failures` within `window`.
    pub fn new(max_failures: usize, window: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            window,
            failures: Mutex::new(VecDeque::new()),
        }
    }
}

impl FailurePolicy for WindowThrottle {
    fn record_failure(&self) -> bool {
        let now = Instant::now();
        let mut failures = self.failures.lock().expect("failure lock");
        failures.push_back(now);
        while let Some(first) = failures.front() {
            if now.duration_since(*first) > self.window {
                failures.pop_front();
            } else {
                break;
            }
        }
        failures.len() >= self.max_failures
    }

    fn reset(&self) {
        self.failures.lock().expect("failure lock").clear();
    }
}
