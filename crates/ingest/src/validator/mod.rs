//! Structural and business validation of a parsed batch.
//!
//! Header problems (duplicate, empty or missing required columns) are hard
//! errors returned as [`TallyError::Schema`]. Record problems are collected
//! into a [`ValidationReport`] tagged with line and column, up to a cap.

mod stats;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tally_core::config::RulesConfig;
use tally_core::{Record, TallyError};

use crate::entity_id::EntityIdPattern;
use crate::parse::parse_non_negative;

pub use stats::ColumnStats;

/// Marker code emitted once the error cap is reached.
pub const TOO_MANY_ERRORS: &str = "TOO_MANY_ERRORS";

/// Columns a batch must provide and how to interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSchema {
    pub required_columns: Vec<String>,
    pub entity_id_column: String,
    pub numeric_columns: Vec<String>,
}

impl BatchSchema {
    /// Schema implied by the business rules: the entity column plus every counter.
    pub fn from_rules(rules: &RulesConfig) -> Self {
        let mut required_columns = vec![rules.entity_id_column.clone()];
        required_columns.extend(rules.counter_columns.iter().cloned());
        Self {
            required_columns,
            entity_id_column: rules.entity_id_column.clone(),
            numeric_columns: rules.counter_columns.clone(),
        }
    }
}

/// A single problem found in a record, or the cap marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// 1-based source line (header is line 1). `None` for batch-level markers.
    pub line: Option<usize>,
    pub column: Option<String>,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    fn at(record: &Record, column: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            line: Some(record.line()),
            column: Some(column.to_string()),
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_records: usize,
    /// Records that passed every check, in input order.
    pub valid: Vec<Record>,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    /// Errors found after the cap was reached and therefore not listed.
    pub suppressed_errors: usize,
    pub column_stats: BTreeMap<String, ColumnStats>,
}

impl ValidationReport {
    pub fn invalid_count(&self) -> usize {
        self.total_records - self.valid.len()
    }

    pub fn is_truncated(&self) -> bool {
        self.errors.iter().any(|e| e.code == TOO_MANY_ERRORS)
    }
}

/// Validates headers and records against a [`BatchSchema`].
#[derive(Debug, Clone)]
pub struct RecordValidator {
    rules: RulesConfig,
    pattern: EntityIdPattern,
}

impl RecordValidator {
    pub fn new(rules: RulesConfig) -> Self {
        let pattern = EntityIdPattern::from_rules(&rules);
        Self { rules, pattern }
    }

    /// Check the observed header row. Any problem here aborts the batch.
    pub fn validate_headers(&self, headers: &[String], schema: &BatchSchema) -> Result<(), TallyError> {
        let mut seen = HashSet::with_capacity(headers.len());
        for (position, header) in headers.iter().enumerate() {
            let name = header.trim();
            if name.is_empty() {
                return Err(TallyError::Schema(format!(
                    "column {} has an empty name",
                    position + 1
                )));
            }
            if !seen.insert(name) {
                return Err(TallyError::Schema(format!("duplicate column '{name}'")));
            }
        }

        let missing: Vec<&str> = schema
            .required_columns
            .iter()
            .map(String::as_str)
            .filter(|c| !seen.contains(c))
            .collect();
        if !missing.is_empty() {
            return Err(TallyError::Schema(format!(
                "missing required columns: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }

    /// Validate a whole batch.
    ///
    /// Returns `Err` only for header problems. Every record is checked even
    /// after the error cap is hit so that `valid` stays exact; only the
    /// listing of further errors stops.
    pub fn validate_batch(
        &self,
        headers: &[String],
        records: &[Record],
        schema: &BatchSchema,
    ) -> Result<ValidationReport, TallyError> {
        self.validate_headers(headers, schema)?;

        let mut report = ValidationReport {
            total_records: records.len(),
            ..ValidationReport::default()
        };
        for header in headers {
            report
                .column_stats
                .insert(header.trim().to_string(), ColumnStats::default());
        }

        let numeric: HashSet<&str> = schema.numeric_columns.iter().map(String::as_str).collect();

        for record in records {
            let mut record_errors = Vec::new();
            self.collect_stats(record, headers, &numeric, &mut report.column_stats);
            self.check_record(record, schema, &mut record_errors, &mut report.warnings);

            if record_errors.is_empty() {
                report.valid.push(record.clone());
                continue;
            }

            for issue in record_errors {
                push_capped(&mut report, issue, self.rules.max_errors);
            }
        }

        if report.suppressed_errors > 0 {
            warn!(
                suppressed = report.suppressed_errors,
                cap = self.rules.max_errors,
                "validation error cap reached"
            );
        }
        debug!(
            total = report.total_records,
            valid = report.valid.len(),
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "batch validated"
        );

        Ok(report)
    }

    fn check_record(
        &self,
        record: &Record,
        schema: &BatchSchema,
        errors: &mut Vec<ValidationIssue>,
        warnings: &mut Vec<ValidationIssue>,
    ) {
        for column in &schema.required_columns {
            let present = record.get(column).map_or(false, |v| !v.trim().is_empty());
            if !present {
                errors.push(ValidationIssue::at(
                    record,
                    column,
                    "MISSING_FIELD",
                    format!("required field '{column}' is missing"),
                ));
            }
        }

        if let Some(id) = record.get(&schema.entity_id_column).map(str::trim) {
            if !id.is_empty() && !self.pattern.matches(id) {
                errors.push(ValidationIssue::at(
                    record,
                    &schema.entity_id_column,
                    "INVALID_ENTITY_ID",
                    format!("'{id}' does not match {}", self.pattern),
                ));
            }
        }

        let mut all_zero = true;
        for column in &schema.numeric_columns {
            let Some(raw) = record.get(column).filter(|v| !v.trim().is_empty()) else {
                continue;
            };
            match parse_non_negative(column, raw, self.rules.max_increment) {
                Ok(value) => {
                    if value > 0 {
                        all_zero = false;
                    }
                    if value > self.rules.warn_increment {
                        warnings.push(ValidationIssue::at(
                            record,
                            column,
                            "HIGH_INCREMENT",
                            format!(
                                "value {value} is above the usual maximum of {}",
                                self.rules.warn_increment
                            ),
                        ));
                    }
                }
                Err(err) => {
                    all_zero = false;
                    errors.push(ValidationIssue::at(record, column, "INVALID_NUMBER", err.to_string()));
                }
            }
        }

        if all_zero && !schema.numeric_columns.is_empty() && errors.is_empty() {
            warnings.push(ValidationIssue {
                line: Some(record.line()),
                column: None,
                code: "ZERO_INCREMENTS".to_string(),
                message: "all increments are zero".to_string(),
            });
        }
    }

    fn collect_stats(
        &self,
        record: &Record,
        headers: &[String],
        numeric: &HashSet<&str>,
        stats: &mut BTreeMap<String, ColumnStats>,
    ) {
        for header in headers {
            let name = header.trim();
            let Some(column) = stats.get_mut(name) else {
                continue;
            };
            match record.get(name).map(str::trim).filter(|v| !v.is_empty()) {
                None => column.observe_null(),
                Some(value) if numeric.contains(name) => match value.parse::<u64>() {
                    Ok(n) => column.observe_number(n),
                    Err(_) => column.observe_text(),
                },
                Some(_) => column.observe_text(),
            }
        }
    }
}

fn push_capped(report: &mut ValidationReport, issue: ValidationIssue, cap: usize) {
    if report.errors.len() < cap {
        report.errors.push(issue);
        if report.errors.len() == cap {
            report.errors.push(ValidationIssue {
                line: None,
                column: None,
                code: TOO_MANY_ERRORS.to_string(),
                message: format!("stopped listing errors after {cap}"),
            });
        }
    } else {
        report.suppressed_errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Vec<String> {
        ["entityId", "counterA", "counterB"].iter().map(|s| s.to_string()).collect()
    }

    fn record(index: usize, entity: &str, a: &str, b: &str) -> Record {
        Record::from_pairs(index, [("entityId", entity), ("counterA", a), ("counterB", b)])
    }

    fn validator() -> (RecordValidator, BatchSchema) {
        let rules = RulesConfig::default();
        let schema = BatchSchema::from_rules(&rules);
        (RecordValidator::new(rules), schema)
    }

    #[test]
    fn accepts_clean_batch() {
        let (v, schema) = validator();
        let records = vec![record(0, "U00001", "1", "2"), record(1, "U00002", "0", "5")];
        let report = v.validate_batch(&headers(), &records, &schema).unwrap();
        assert_eq!(report.valid.len(), 2);
        assert!(report.errors.is_empty());
        assert_eq!(report.invalid_count(), 0);
    }

    #[test]
    fn duplicate_header_is_hard_error() {
        let (v, schema) = validator();
        let mut h = headers();
        h.push("counterA".into());
        let err = v.validate_batch(&h, &[], &schema).unwrap_err();
        assert!(matches!(err, TallyError::Schema(ref m) if m.contains("duplicate")));
    }

    #[test]
    fn empty_header_is_hard_error() {
        let (v, schema) = validator();
        let mut h = headers();
        h.push("  ".into());
        assert!(matches!(
            v.validate_headers(&h, &schema),
            Err(TallyError::Schema(_))
        ));
    }

    #[test]
    fn missing_required_column_is_hard_error() {
        let (v, schema) = validator();
        let h = vec!["entityId".to_string(), "counterA".to_string()];
        let err = v.validate_headers(&h, &schema).unwrap_err();
        assert!(err.to_string().contains("counterB"));
    }

    #[test]
    fn extra_columns_are_allowed() {
        let (v, schema) = validator();
        let mut h = headers();
        h.push("note".into());
        assert!(v.validate_headers(&h, &schema).is_ok());
    }

    #[test]
    fn record_errors_carry_line_and_column() {
        let (v, schema) = validator();
        let records = vec![
            record(0, "U00001", "1", "0"),
            record(1, "INVALID", "1", "0"),
            record(2, "U00003", "-4", "x"),
        ];
        let report = v.validate_batch(&headers(), &records, &schema).unwrap();

        assert_eq!(report.valid.len(), 1);
        assert_eq!(report.errors.len(), 3);

        let id_err = &report.errors[0];
        assert_eq!(id_err.line, Some(3));
        assert_eq!(id_err.column.as_deref(), Some("entityId"));
        assert_eq!(id_err.code, "INVALID_ENTITY_ID");

        let columns: Vec<_> = report.errors[1..]
            .iter()
            .map(|e| e.column.clone().unwrap())
            .collect();
        assert_eq!(columns, vec!["counterA", "counterB"]);
        assert!(report.errors[1].message.contains("negative"));
    }

    #[test]
    fn issues_point_at_source_lines_past_blank_rows() {
        let (v, schema) = validator();
        let text = "entityId,counterA,counterB\n\nU00001,1,0\n\n\"INVALID\",1,0\n";
        let (h, records) = crate::reader::read_delimited(text, ',').unwrap();
        let report = v.validate_batch(&h, &records, &schema).unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].line, Some(5));
        assert_eq!(report.errors[0].code, "INVALID_ENTITY_ID");
    }

    #[test]
    fn missing_field_reported() {
        let (v, schema) = validator();
        let r = Record::from_pairs(0, [("entityId", "U00001"), ("counterA", "1"), ("counterB", "")]);
        let report = v.validate_batch(&headers(), &[r], &schema).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, "MISSING_FIELD");
    }

    #[test]
    fn high_values_warn_without_blocking() {
        let (v, schema) = validator();
        let records = vec![record(0, "U00001", "5000", "0")];
        let report = v.validate_batch(&headers(), &records, &schema).unwrap();
        assert_eq!(report.valid.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].code, "HIGH_INCREMENT");
    }

    #[test]
    fn zero_increments_only_warn() {
        let (v, schema) = validator();
        let report = v
            .validate_batch(&headers(), &[record(0, "U00002", "0", "0")], &schema)
            .unwrap();
        assert_eq!(report.valid.len(), 1);
        assert_eq!(report.warnings[0].code, "ZERO_INCREMENTS");
    }

    #[test]
    fn error_cap_emits_marker_and_stops_listing() {
        let rules = RulesConfig {
            max_errors: 3,
            ..RulesConfig::default()
        };
        let schema = BatchSchema::from_rules(&rules);
        let v = RecordValidator::new(rules);

        let records: Vec<Record> = (0..10).map(|i| record(i, "BAD", "1", "1")).collect();
        let report = v.validate_batch(&headers(), &records, &schema).unwrap();

        assert_eq!(report.errors.len(), 4);
        assert_eq!(report.errors[3].code, TOO_MANY_ERRORS);
        assert!(report.is_truncated());
        assert_eq!(report.suppressed_errors, 7);
        assert_eq!(report.valid.len(), 0);
    }

    #[test]
    fn column_stats_cover_every_header() {
        let (v, schema) = validator();
        let records = vec![
            record(0, "U00001", "2", "1"),
            record(1, "U00002", "4", ""),
            record(2, "U00003", "9", "3"),
        ];
        let report = v.validate_batch(&headers(), &records, &schema).unwrap();

        let a = &report.column_stats["counterA"];
        assert_eq!(a.min, Some(2));
        assert_eq!(a.max, Some(9));
        assert_eq!(a.avg, Some(5.0));

        let b = &report.column_stats["counterB"];
        assert_eq!(b.null_count, 1);

        let id = &report.column_stats["entityId"];
        assert_eq!(id.non_null_count, 3);
        assert!(id.min.is_none());
    }
}
