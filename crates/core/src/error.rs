use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad origin of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// User or data caused. Surfaced as-is, never retried.
    Business,
    /// Programming or consistency fault. Retryable by default but worth investigating.
    System,
    /// Dependency fault (timeouts, throttling, connection resets).
    Infrastructure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Business => write!(f, "BUSINESS"),
            ErrorKind::System => write!(f, "SYSTEM"),
            ErrorKind::Infrastructure => write!(f, "INFRASTRUCTURE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Classification attached to every caught error. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    /// Stable machine-readable code, e.g. `VALIDATION_ERROR`.
    pub code: String,
    pub retryable: bool,
    pub severity: Severity,
}

impl ErrorClassification {
    pub fn new(kind: ErrorKind, code: impl Into<String>, retryable: bool, severity: Severity) -> Self {
        Self {
            kind,
            code: code.into(),
            retryable,
            severity,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Errors raised anywhere in the tally pipeline.
///
/// Each variant declares its own [`ErrorKind`], code and default retryability
/// so classification never has to guess from the message. Errors coming from
/// third-party code without a declared kind go through [`TallyError::External`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TallyError {
    #[error("validation failed on '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("business rule violated: {0}")]
    BusinessRule(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("consistency check failed: {0}")]
    Consistency(String),

    #[error("version conflict on {entity_id}: expected {expected}, found {actual}")]
    Conflict {
        entity_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("circuit '{name}' is open")]
    CircuitOpen { name: String },

    #[error("chunk has {size} items, maximum is {max}")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("config error: {0}")]
    Config(String),

    /// An error from a collaborator that carries no declared kind.
    #[error("{message}")]
    External { code: Option<String>, message: String },
}

impl TallyError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        TallyError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn external(message: impl Into<String>) -> Self {
        TallyError::External {
            code: None,
            message: message.into(),
        }
    }

    /// Stable code for this error. `External` reports its own code when it has one.
    pub fn code(&self) -> &str {
        match self {
            TallyError::Validation { .. } => "VALIDATION_ERROR",
            TallyError::BusinessRule(_) => "BUSINESS_RULE_VIOLATION",
            TallyError::NotFound(_) => "NOT_FOUND",
            TallyError::Consistency(_) => "CONSISTENCY_ERROR",
            TallyError::Conflict { .. } => "CONFLICT",
            TallyError::Timeout(_) => "TIMEOUT",
            TallyError::Connection(_) => "CONNECTION_ERROR",
            TallyError::Throttled(_) => "THROTTLED",
            TallyError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            TallyError::ChunkTooLarge { .. } => "CHUNK_TOO_LARGE",
            TallyError::Schema(_) => "SCHEMA_ERROR",
            TallyError::DataCorruption(_) => "DATA_CORRUPTION",
            TallyError::Security(_) => "SECURITY_VIOLATION",
            TallyError::OutOfMemory(_) => "OUT_OF_MEMORY",
            TallyError::Config(_) => "CONFIG_ERROR",
            TallyError::External { code, .. } => code.as_deref().unwrap_or("EXTERNAL_ERROR"),
        }
    }

    /// Declared classification, or `None` when the error has to be classified
    /// by pattern matching (`External`).
    pub fn declared_classification(&self) -> Option<ErrorClassification> {
        use ErrorKind::*;
        use Severity::*;

        let (kind, retryable, severity) = match self {
            TallyError::Validation { .. } => (Business, false, Warning),
            TallyError::BusinessRule(_) => (Business, false, Warning),
            TallyError::NotFound(_) => (Business, false, Warning),
            TallyError::Schema(_) => (Business, false, Error),
            TallyError::ChunkTooLarge { .. } => (Business, false, Error),
            TallyError::Consistency(_) => (System, true, Error),
            // Fail fast: a re-read is needed, not a blind retry.
            TallyError::Conflict { .. } => (System, false, Warning),
            TallyError::Config(_) => (System, false, Error),
            TallyError::Timeout(_) => (Infrastructure, true, Warning),
            TallyError::Connection(_) => (Infrastructure, true, Warning),
            TallyError::Throttled(_) => (Infrastructure, true, Warning),
            // The breaker already decided; retrying inside the cooldown is pointless.
            TallyError::CircuitOpen { .. } => (Infrastructure, false, Error),
            TallyError::DataCorruption(_) => (System, false, Critical),
            TallyError::Security(_) => (System, false, Critical),
            TallyError::OutOfMemory(_) => (System, false, Critical),
            TallyError::External { .. } => return None,
        };

        Some(ErrorClassification::new(kind, self.code(), retryable, severity))
    }

    /// Message text used by the pattern-matching fallback.
    pub fn message(&self) -> String {
        match self {
            TallyError::External { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = TallyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_errors_are_not_retryable() {
        for err in [
            TallyError::validation("entityId", "bad format"),
            TallyError::BusinessRule("all increments are zero".into()),
            TallyError::NotFound("U00001".into()),
        ] {
            let c = err.declared_classification().unwrap();
            assert_eq!(c.kind, ErrorKind::Business);
            assert!(!c.retryable, "{} should not be retryable", err.code());
        }
    }

    #[test]
    fn infrastructure_errors_are_retryable() {
        for err in [
            TallyError::Timeout(500),
            TallyError::Connection("reset by peer".into()),
            TallyError::Throttled("slow down".into()),
        ] {
            let c = err.declared_classification().unwrap();
            assert_eq!(c.kind, ErrorKind::Infrastructure);
            assert!(c.retryable);
        }
    }

    #[test]
    fn consistency_is_system_and_retryable() {
        let c = TallyError::Consistency("sum mismatch".into())
            .declared_classification()
            .unwrap();
        assert_eq!(c.kind, ErrorKind::System);
        assert!(c.retryable);
        assert_eq!(c.code, "CONSISTENCY_ERROR");
    }

    #[test]
    fn critical_patterns_have_critical_severity() {
        let c = TallyError::DataCorruption("checksum".into())
            .declared_classification()
            .unwrap();
        assert!(c.is_critical());
    }

    #[test]
    fn external_has_no_declared_classification() {
        let err = TallyError::External {
            code: Some("ECONNRESET".into()),
            message: "socket hang up".into(),
        };
        assert!(err.declared_classification().is_none());
        assert_eq!(err.code(), "ECONNRESET");
        assert_eq!(err.to_string(), "socket hang up");
        assert_eq!(TallyError::external("boom").code(), "EXTERNAL_ERROR");
    }

    #[test]
    fn kind_serializes_screaming_case() {
        let json = serde_json::to_string(&ErrorKind::Infrastructure).unwrap();
        assert_eq!(json, "\"INFRASTRUCTURE\"");
        assert_eq!(Severity::Critical.to_string(), "CRITICAL");
    }
}
