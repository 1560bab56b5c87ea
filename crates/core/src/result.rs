//! Per-item and per-chunk processing results.
//!
//! Failure is represented as data: an item that could not be applied becomes
//! an [`ItemResult`] carrying an [`ItemError`], never an error returned from
//! chunk processing.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorClassification, ErrorKind, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Success,
    Error,
}

/// Counters before and after a successful update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsUpdate {
    pub previous: BTreeMap<String, i64>,
    pub updated: BTreeMap<String, i64>,
    pub version: u64,
}

/// Classified failure of a single item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    #[serde(flatten)]
    pub classification: ErrorClassification,
    pub message: String,
}

impl ItemError {
    pub fn kind(&self) -> ErrorKind {
        self.classification.kind
    }

    pub fn code(&self) -> &str {
        &self.classification.code
    }

    pub fn retryable(&self) -> bool {
        self.classification.retryable
    }
}

/// Exactly one of a success payload or an error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemOutcome {
    Success(StatisticsUpdate),
    Error(ItemError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_index: usize,
    /// Known once the record has been parsed far enough to read it.
    pub entity_id: Option<String>,
    pub processing_time_ms: u64,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

impl ItemResult {
    pub fn status(&self) -> ItemStatus {
        match self.outcome {
            ItemOutcome::Success(_) => ItemStatus::Success,
            ItemOutcome::Error(_) => ItemStatus::Error,
        }
    }

    pub fn error(&self) -> Option<&ItemError> {
        match &self.outcome {
            ItemOutcome::Error(e) => Some(e),
            ItemOutcome::Success(_) => None,
        }
    }

    pub fn update(&self) -> Option<&StatisticsUpdate> {
        match &self.outcome {
            ItemOutcome::Success(u) => Some(u),
            ItemOutcome::Error(_) => None,
        }
    }
}

/// Tally of a set of classified errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Error count keyed by error code.
    pub errors_by_type: HashMap<String, u64>,
    pub retryable_count: u64,
    pub non_retryable_count: u64,
    /// Errors that matched a critical pattern (corruption, security, out-of-memory).
    pub critical_errors: Vec<ItemError>,
}

impl ErrorSummary {
    pub fn total(&self) -> u64 {
        self.retryable_count + self.non_retryable_count
    }

    pub fn has_critical(&self) -> bool {
        !self.critical_errors.is_empty()
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        if self.has_critical() {
            Some(Severity::Critical)
        } else if self.total() > 0 {
            Some(Severity::Error)
        } else {
            None
        }
    }
}

/// Outcome of one processed chunk.
///
/// `results` and `errors` are unordered; consumers key them by `item_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk_id: String,
    pub batch_index: usize,
    pub execution_id: String,
    pub processed_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub processing_time_ms: u64,
    pub results: Vec<ItemResult>,
    pub errors: Vec<ItemResult>,
    #[serde(default)]
    pub error_summary: ErrorSummary,
}

impl ChunkResult {
    /// Fraction of processed items that failed, `0.0` for an empty chunk.
    pub fn error_ratio(&self) -> f64 {
        if self.processed_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.processed_count as f64
        }
    }

    /// Find the result for an input position regardless of outcome.
    pub fn item(&self, item_index: usize) -> Option<&ItemResult> {
        self.results
            .iter()
            .chain(self.errors.iter())
            .find(|r| r.item_index == item_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_item(index: usize, code: &str) -> ItemResult {
        ItemResult {
            item_index: index,
            entity_id: None,
            processing_time_ms: 1,
            outcome: ItemOutcome::Error(ItemError {
                classification: ErrorClassification::new(
                    ErrorKind::Business,
                    code,
                    false,
                    Severity::Warning,
                ),
                message: "bad".into(),
            }),
        }
    }

    #[test]
    fn status_follows_outcome() {
        let r = error_item(3, "VALIDATION_ERROR");
        assert_eq!(r.status(), ItemStatus::Error);
        assert_eq!(r.error().unwrap().code(), "VALIDATION_ERROR");
        assert!(r.update().is_none());
    }

    #[test]
    fn item_result_json_shape() {
        let json = serde_json::to_value(error_item(1, "NOT_FOUND")).unwrap();
        assert_eq!(json["status"], "ERROR");
        assert_eq!(json["code"], "NOT_FOUND");
        assert_eq!(json["kind"], "BUSINESS");
        assert_eq!(json["retryable"], false);
    }

    #[test]
    fn chunk_lookup_and_ratio() {
        let chunk = ChunkResult {
            chunk_id: "c".into(),
            batch_index: 0,
            execution_id: "e".into(),
            processed_count: 4,
            success_count: 3,
            error_count: 1,
            processing_time_ms: 10,
            results: vec![],
            errors: vec![error_item(2, "TIMEOUT")],
            error_summary: ErrorSummary::default(),
        };
        assert_eq!(chunk.error_ratio(), 0.25);
        assert!(chunk.item(2).is_some());
        assert!(chunk.item(0).is_none());
    }
}
