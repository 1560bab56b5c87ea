//! Classification, aggregation and escalation of item failures.

mod escalation;

pub use escalation::{Escalation, EscalationReason, EscalationTracker};

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, warn};

use tally_core::config::EscalationConfig;
use tally_core::{
    classify, Clock, ErrorClassification, ErrorSummary, ItemError, SystemClock, TallyError,
};
use tally_storage::{Incident, IncidentSink};

pub struct ErrorHandlingService {
    tracker: EscalationTracker,
    incidents: Arc<dyn IncidentSink>,
}

impl ErrorHandlingService {
    pub fn new(config: EscalationConfig, incidents: Arc<dyn IncidentSink>) -> Self {
        Self::with_clock(config, incidents, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: EscalationConfig,
        incidents: Arc<dyn IncidentSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracker: EscalationTracker::new(config, clock),
            incidents,
        }
    }

    pub fn tracker(&self) -> &EscalationTracker {
        &self.tracker
    }

    pub fn classify(&self, err: &TallyError) -> ErrorClassification {
        classify(err)
    }

    /// Classify `err` into item-level data without recording it.
    pub fn to_item_error(&self, err: &TallyError) -> ItemError {
        ItemError {
            classification: self.classify(err),
            message: err.to_string(),
        }
    }

    /// Classify, record and, if warranted, escalate a failure in `scope`.
    ///
    /// Escalation is best-effort: a failing incident sink is logged and
    /// otherwise ignored.
    pub async fn handle(&self, scope: &str, err: &TallyError) -> ItemError {
        let item_error = self.to_item_error(err);
        let escalation = self.tracker.record(scope, &item_error.classification);

        if escalation.should_escalate() {
            let incident = Incident {
                id: uuid::Uuid::new_v4(),
                scope: scope.to_string(),
                classification: item_error.classification.clone(),
                message: item_error.message.clone(),
                streak: escalation.streak,
                window_count: escalation.window_count,
                raised_at: Utc::now(),
            };
            warn!(
                scope,
                code = %item_error.code(),
                reason = ?escalation.reason,
                streak = escalation.streak,
                "escalating failure"
            );
            if let Err(e) = self.incidents.raise(incident).await {
                error!(scope, error = %e, "failed to raise incident");
            }
        }

        item_error
    }

    /// Tally already-classified errors.
    pub fn summarize<'a>(&self, errors: impl IntoIterator<Item = &'a ItemError>) -> ErrorSummary {
        let mut summary = ErrorSummary::default();
        for e in errors {
            *summary
                .errors_by_type
                .entry(e.code().to_string())
                .or_insert(0) += 1;
            if e.retryable() {
                summary.retryable_count += 1;
            } else {
                summary.non_retryable_count += 1;
            }
            if e.classification.is_critical() {
                summary.critical_errors.push(e.clone());
            }
        }
        summary
    }

    /// Classify and tally raw errors.
    pub fn aggregate(&self, errors: &[TallyError]) -> ErrorSummary {
        let classified: Vec<ItemError> = errors.iter().map(|e| self.to_item_error(e)).collect();
        self.summarize(&classified)
    }
}
