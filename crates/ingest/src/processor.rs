//! Domain rules: record → [`UpdateInstruction`] → new [`EntityStatistics`].

use chrono::Utc;

use tally_core::config::RulesConfig;
use tally_core::{EntityStatistics, Record, TallyError, UpdateInstruction};

use crate::entity_id::EntityIdPattern;
use crate::parse::parse_non_negative;

/// Converts raw records into typed updates and applies them to statistics.
#[derive(Debug, Clone)]
pub struct RecordProcessor {
    rules: RulesConfig,
    pattern: EntityIdPattern,
}

impl RecordProcessor {
    pub fn new(rules: RulesConfig) -> Self {
        let pattern = EntityIdPattern::from_rules(&rules);
        Self { rules, pattern }
    }

    pub fn rules(&self) -> &RulesConfig {
        &self.rules
    }

    /// Read the entity id without validating anything else, for error reporting.
    pub fn entity_id_of<'a>(&self, record: &'a Record) -> Option<&'a str> {
        record
            .get(&self.rules.entity_id_column)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Parse a record into an update instruction.
    ///
    /// Fails with [`TallyError::Validation`] when a required field is missing,
    /// the entity id is malformed, or a counter is not a non-negative integer
    /// within the configured ceiling.
    pub fn to_instruction(&self, record: &Record) -> Result<UpdateInstruction, TallyError> {
        let column = &self.rules.entity_id_column;
        let entity_id = self
            .entity_id_of(record)
            .ok_or_else(|| TallyError::validation(column, "required field is missing"))?;

        if !self.pattern.matches(entity_id) {
            return Err(TallyError::validation(
                column,
                format!("'{entity_id}' does not match {}", self.pattern),
            ));
        }

        let mut increments = std::collections::BTreeMap::new();
        for counter in &self.rules.counter_columns {
            let raw = record
                .get(counter)
                .ok_or_else(|| TallyError::validation(counter, "required field is missing"))?;
            let value = parse_non_negative(counter, raw, self.rules.max_increment)?;
            increments.insert(counter.clone(), value);
        }

        Ok(UpdateInstruction {
            entity_id: entity_id.to_string(),
            increments,
        })
    }

    /// Apply an instruction on top of the current statistics.
    ///
    /// The returned statistics keep `current.version`; the store bumps it on
    /// write. Counters absent from the instruction are carried over untouched.
    pub fn apply_instruction(
        &self,
        current: &EntityStatistics,
        instruction: &UpdateInstruction,
        execution_id: &str,
    ) -> Result<EntityStatistics, TallyError> {
        if self.rules.reject_zero_increments && instruction.is_all_zero() {
            return Err(TallyError::BusinessRule(format!(
                "all increments for {} are zero",
                instruction.entity_id
            )));
        }

        if current.entity_id != instruction.entity_id {
            return Err(TallyError::Consistency(format!(
                "statistics for {} used to apply update for {}",
                current.entity_id, instruction.entity_id
            )));
        }

        let mut counters = current.counters.clone();
        for (field, increment) in &instruction.increments {
            let old = current.counter(field);
            let delta = i64::try_from(*increment).map_err(|_| {
                TallyError::Consistency(format!("increment {increment} for {field} exceeds i64"))
            })?;
            let new = old.checked_add(delta).ok_or_else(|| {
                TallyError::Consistency(format!("{field} overflows: {old} + {delta}"))
            })?;
            counters.insert(field.clone(), new);
        }

        let updated = EntityStatistics {
            entity_id: current.entity_id.clone(),
            counters,
            last_updated: Utc::now(),
            last_execution_id: Some(execution_id.to_string()),
            version: current.version,
        };

        verify_update(current, &updated, instruction)?;
        Ok(updated)
    }
}

/// Post-update self-check: every counter moved by exactly its increment and
/// none went backwards.
pub fn verify_update(
    previous: &EntityStatistics,
    updated: &EntityStatistics,
    instruction: &UpdateInstruction,
) -> Result<(), TallyError> {
    for (field, old) in &previous.counters {
        let new = updated.counter(field);
        if new < *old {
            return Err(TallyError::Consistency(format!(
                "{field} decreased from {old} to {new}"
            )));
        }
    }

    for (field, increment) in &instruction.increments {
        let old = previous.counter(field);
        let new = updated.counter(field);
        let expected = i128::from(old) + i128::from(*increment);
        if i128::from(new) != expected {
            return Err(TallyError::Consistency(format!(
                "{field}: {old} + {increment} produced {new}"
            )));
        }
    }

    Ok(())
}
