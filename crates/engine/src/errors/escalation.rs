use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tally_core::config::EscalationConfig;
use tally_core::{Clock, ErrorClassification};

/// Why a failure was promoted to an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    Critical,
    Streak,
}

/// Result of recording one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub reason: Option<EscalationReason>,
    /// Consecutive failures of this type, including this one.
    pub streak: u32,
    /// Failures of this type inside the rolling window, including this one.
    pub window_count: usize,
}

impl Escalation {
    pub fn should_escalate(&self) -> bool {
        self.reason.is_some()
    }
}

#[derive(Debug, Default)]
struct FailureWindow {
    occurrences: VecDeque<Instant>,
    streak: u32,
    last_at: Option<Instant>,
}

/// Tracks failures per `(scope, error code)`.
///
/// A failure arriving within the inter-arrival gap of the previous one of the
/// same type extends the streak; otherwise the streak restarts at 1. Once the
/// streak exceeds the threshold an escalation is reported and the streak is
/// reset, so a sustained burst escalates once per `threshold + 1` failures.
/// Critical failures always escalate.
pub struct EscalationTracker {
    config: EscalationConfig,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<(String, String), FailureWindow>>,
}

impl EscalationTracker {
    pub fn new(config: EscalationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, scope: &str, classification: &ErrorClassification) -> Escalation {
        let now = self.clock.now();
        let gap = self.config.inter_arrival();
        let window_len = self.config.window();

        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = windows
            .entry((scope.to_string(), classification.code.clone()))
            .or_default();

        while let Some(&oldest) = entry.occurrences.front() {
            if now.saturating_duration_since(oldest) > window_len {
                entry.occurrences.pop_front();
            } else {
                break;
            }
        }
        entry.occurrences.push_back(now);

        let consecutive = entry
            .last_at
            .is_some_and(|last| now.saturating_duration_since(last) <= gap);
        entry.streak = if consecutive { entry.streak + 1 } else { 1 };
        entry.last_at = Some(now);

        let streak = entry.streak;
        let reason = if classification.is_critical() {
            Some(EscalationReason::Critical)
        } else if streak > self.config.streak_threshold {
            entry.streak = 0;
            Some(EscalationReason::Streak)
        } else {
            None
        };

        Escalation {
            reason,
            streak,
            window_count: entry.occurrences.len(),
        }
    }

    /// Drop all state kept for `scope`, e.g. once an execution has finished.
    pub fn forget_scope(&self, scope: &str) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.retain(|(s, _), _| s != scope);
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
