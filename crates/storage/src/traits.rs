//! Storage and side-channel trait definitions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{EntityStatistics, ErrorClassification, TallyError};

/// Persistent per-entity statistics.
#[async_trait::async_trait]
pub trait EntityStatisticsStore: Send + Sync {
    /// Current statistics, or `None` for an entity never written.
    async fn get(&self, entity_id: &str) -> Result<Option<EntityStatistics>, TallyError>;

    /// Persist `stats` and return what was stored, with its version bumped.
    ///
    /// With `expected_version` set the write only succeeds if the stored
    /// version (0 for an absent entity) still equals it; otherwise it fails
    /// with [`TallyError::Conflict`]. `None` writes unconditionally.
    async fn put(
        &self,
        stats: EntityStatistics,
        expected_version: Option<u64>,
    ) -> Result<EntityStatistics, TallyError>;
}

/// Record of one applied update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub execution_id: String,
    pub chunk_id: String,
    pub item_index: usize,
    pub entity_id: String,
    pub previous: BTreeMap<String, i64>,
    pub updated: BTreeMap<String, i64>,
    pub version: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only audit trail. Callers treat failures as non-fatal.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), TallyError>;
}

/// Operator-facing alert raised by escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: uuid::Uuid,
    /// Scope the failures were grouped under, usually the execution id.
    pub scope: String,
    pub classification: ErrorClassification,
    pub message: String,
    /// Consecutive failures of this type at the time of escalation.
    pub streak: u32,
    /// Failures of this type inside the rolling window.
    pub window_count: usize,
    pub raised_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait IncidentSink: Send + Sync {
    async fn raise(&self, incident: Incident) -> Result<(), TallyError>;
}
