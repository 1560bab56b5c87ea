//! Error classification.
//!
//! Errors that declare their kind are classified from the declaration. Only
//! errors without one ([`TallyError::External`]) fall back to matching their
//! code and message against [`PATTERNS`].

use crate::error::{ErrorClassification, ErrorKind, Severity, TallyError};

struct Pattern {
    needles: &'static [&'static str],
    code: &'static str,
    kind: ErrorKind,
    retryable: bool,
    severity: Severity,
}

/// Checked in order; the first row with a matching needle wins.
const PATTERNS: &[Pattern] = &[
    Pattern {
        needles: &["corrupt", "checksum mismatch", "integrity"],
        code: "DATA_CORRUPTION",
        kind: ErrorKind::System,
        retryable: false,
        severity: Severity::Critical,
    },
    Pattern {
        needles: &["security", "unauthorized", "forbidden", "access denied"],
        code: "SECURITY_VIOLATION",
        kind: ErrorKind::System,
        retryable: false,
        severity: Severity::Critical,
    },
    Pattern {
        needles: &["out of memory", "outofmemory", "oomkilled", "memory allocation"],
        code: "OUT_OF_MEMORY",
        kind: ErrorKind::System,
        retryable: false,
        severity: Severity::Critical,
    },
    Pattern {
        needles: &["timeout", "timed out", "deadline exceeded"],
        code: "TIMEOUT",
        kind: ErrorKind::Infrastructure,
        retryable: true,
        severity: Severity::Warning,
    },
    Pattern {
        needles: &["throttl", "rate limit", "rate exceeded", "too many requests", "slow down"],
        code: "THROTTLED",
        kind: ErrorKind::Infrastructure,
        retryable: true,
        severity: Severity::Warning,
    },
    Pattern {
        needles: &[
            "connection",
            "econnreset",
            "econnrefused",
            "socket hang up",
            "broken pipe",
            "network",
            "service unavailable",
        ],
        code: "CONNECTION_ERROR",
        kind: ErrorKind::Infrastructure,
        retryable: true,
        severity: Severity::Warning,
    },
    Pattern {
        needles: &["not found", "notfound", "no such"],
        code: "NOT_FOUND",
        kind: ErrorKind::Business,
        retryable: false,
        severity: Severity::Warning,
    },
    Pattern {
        needles: &["business rule", "validation", "invalid"],
        code: "VALIDATION_ERROR",
        kind: ErrorKind::Business,
        retryable: false,
        severity: Severity::Warning,
    },
];

/// Classify an error, preferring its declared classification.
pub fn classify(error: &TallyError) -> ErrorClassification {
    if let Some(declared) = error.declared_classification() {
        return declared;
    }
    match error {
        TallyError::External { code, message } => classify_message(code.as_deref(), message),
        other => classify_message(None, &other.to_string()),
    }
}

/// Pattern-matching fallback for errors of unknown origin.
///
/// An explicit `code` is kept in the result; otherwise the matched pattern's
/// code is used, or `UNKNOWN_ERROR` when nothing matches.
pub fn classify_message(code: Option<&str>, message: &str) -> ErrorClassification {
    let haystack = match code {
        Some(c) => format!("{} {}", c, message).to_lowercase(),
        None => message.to_lowercase(),
    };

    let matched = PATTERNS
        .iter()
        .find(|p| p.needles.iter().any(|n| haystack.contains(n)));

    match matched {
        Some(p) => ErrorClassification::new(p.kind, code.unwrap_or(p.code), p.retryable, p.severity),
        None => ErrorClassification::new(
            ErrorKind::System,
            code.unwrap_or("UNKNOWN_ERROR"),
            true,
            Severity::Error,
        ),
    }
}

pub fn is_retryable(error: &TallyError) -> bool {
    classify(error).retryable
}
