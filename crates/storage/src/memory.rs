use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use tally_core::{EntityStatistics, TallyError};

use crate::traits::{AuditEntry, AuditSink, EntityStatisticsStore, Incident, IncidentSink};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-local statistics store with version-checked writes.
#[derive(Debug, Default)]
pub struct InMemoryStatisticsStore {
    entities: Mutex<HashMap<String, EntityStatistics>>,
}

impl InMemoryStatisticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, keeping the given version as-is.
    pub fn insert(&self, stats: EntityStatistics) {
        lock(&self.entities).insert(stats.entity_id.clone(), stats);
    }

    pub fn len(&self) -> usize {
        lock(&self.entities).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every stored entity, sorted by id.
    pub fn snapshot(&self) -> Vec<EntityStatistics> {
        let mut all: Vec<_> = lock(&self.entities).values().cloned().collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }
}

#[async_trait::async_trait]
impl EntityStatisticsStore for InMemoryStatisticsStore {
    async fn get(&self, entity_id: &str) -> Result<Option<EntityStatistics>, TallyError> {
        Ok(lock(&self.entities).get(entity_id).cloned())
    }

    async fn put(
        &self,
        mut stats: EntityStatistics,
        expected_version: Option<u64>,
    ) -> Result<EntityStatistics, TallyError> {
        let mut entities = lock(&self.entities);
        let stored_version = entities.get(&stats.entity_id).map_or(0, |s| s.version);

        if let Some(expected) = expected_version {
            if expected != stored_version {
                debug!(
                    entity_id = %stats.entity_id,
                    expected,
                    actual = stored_version,
                    "version check failed"
                );
                return Err(TallyError::Conflict {
                    entity_id: stats.entity_id,
                    expected,
                    actual: stored_version,
                });
            }
        }

        stats.version = stored_version + 1;
        entities.insert(stats.entity_id.clone(), stats.clone());
        Ok(stats)
    }
}

/// Collects audit entries in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: AuditEntry) -> Result<(), TallyError> {
        lock(&self.entries).push(entry);
        Ok(())
    }
}

/// Collects raised incidents in memory.
#[derive(Debug, Default)]
pub struct InMemoryIncidentSink {
    incidents: Mutex<Vec<Incident>>,
}

impl InMemoryIncidentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        lock(&self.incidents).clone()
    }
}

#[async_trait::async_trait]
impl IncidentSink for InMemoryIncidentSink {
    async fn raise(&self, incident: Incident) -> Result<(), TallyError> {
        lock(&self.incidents).push(incident);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_entity_reads_as_none() {
        let store = InMemoryStatisticsStore::new();
        assert!(store.get("U00001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_write_creates_version_one() {
        let store = InMemoryStatisticsStore::new();
        let stats = EntityStatistics::empty("U00001").with_counter("counterA", 3);

        let written = store.put(stats, Some(0)).await.unwrap();
        assert_eq!(written.version, 1);

        let read = store.get("U00001").await.unwrap().unwrap();
        assert_eq!(read.counter("counterA"), 3);
        assert_eq!(read.version, 1);
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let store = InMemoryStatisticsStore::new();
        store
            .put(EntityStatistics::empty("U00001"), None)
            .await
            .unwrap();
        store
            .put(EntityStatistics::empty("U00001"), None)
            .await
            .unwrap();

        let err = store
            .put(EntityStatistics::empty("U00001"), Some(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TallyError::Conflict {
                entity_id: "U00001".into(),
                expected: 1,
                actual: 2,
            }
        );
        // Rejected write left the stored record untouched.
        assert_eq!(store.get("U00001").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn unconditional_put_ignores_version() {
        let store = InMemoryStatisticsStore::new();
        let mut seeded = EntityStatistics::empty("U00007");
        seeded.version = 9;
        store.insert(seeded);

        let written = store
            .put(EntityStatistics::empty("U00007"), None)
            .await
            .unwrap();
        assert_eq!(written.version, 10);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn audit_sink_keeps_entries_in_order() {
        let sink = InMemoryAuditSink::new();
        for i in 0..3 {
            sink.append(AuditEntry {
                execution_id: "exec".into(),
                chunk_id: "c0".into(),
                item_index: i,
                entity_id: format!("U0000{i}"),
                previous: Default::default(),
                updated: Default::default(),
                version: 1,
                recorded_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        }
        let indices: Vec<_> = sink.entries().iter().map(|e| e.item_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
