use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typed update derived from one record. Discarded after it is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInstruction {
    pub entity_id: String,
    /// Non-negative increment per counter field.
    pub increments: BTreeMap<String, u64>,
}

impl UpdateInstruction {
    pub fn is_all_zero(&self) -> bool {
        self.increments.values().all(|v| *v == 0)
    }

    pub fn increment(&self, field: &str) -> u64 {
        self.increments.get(field).copied().unwrap_or(0)
    }
}

/// Persistent per-entity counters. Counters only ever grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStatistics {
    pub entity_id: String,
    pub counters: BTreeMap<String, i64>,
    pub last_updated: DateTime<Utc>,
    pub last_execution_id: Option<String>,
    /// Bumped on every successful write; used for optimistic updates.
    pub version: u64,
}

impl EntityStatistics {
    /// Fresh statistics for an entity the store has never seen.
    pub fn empty(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            counters: BTreeMap::new(),
            last_updated: Utc::now(),
            last_execution_id: None,
            version: 0,
        }
    }

    pub fn counter(&self, field: &str) -> i64 {
        self.counters.get(field).copied().unwrap_or(0)
    }

    pub fn with_counter(mut self, field: impl Into<String>, value: i64) -> Self {
        self.counters.insert(field.into(), value);
        self
    }
}
