//! Sinks that write to the `tracing` pipeline instead of a store.

use tracing::{error, info, warn};

use tally_core::{Severity, TallyError};

use crate::traits::{AuditEntry, AuditSink, Incident, IncidentSink};

/// Emits each audit entry as a structured `info!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

#[async_trait::async_trait]
impl AuditSink for LogAuditSink {
    async fn append(&self, entry: AuditEntry) -> Result<(), TallyError> {
        let updated = serde_json::to_string(&entry.updated)
            .map_err(|e| TallyError::external(format!("audit serialization failed: {e}")))?;
        info!(
            target: "tally::audit",
            execution_id = %entry.execution_id,
            chunk_id = %entry.chunk_id,
            item_index = entry.item_index,
            entity_id = %entry.entity_id,
            version = entry.version,
            updated = %updated,
            "statistics updated"
        );
        Ok(())
    }
}

/// Emits incidents at `error!` when critical, `warn!` otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIncidentSink;

#[async_trait::async_trait]
impl IncidentSink for LogIncidentSink {
    async fn raise(&self, incident: Incident) -> Result<(), TallyError> {
        let c = &incident.classification;
        if c.severity >= Severity::Critical {
            error!(
                target: "tally::incident",
                incident_id = %incident.id,
                scope = %incident.scope,
                kind = %c.kind,
                code = %c.code,
                streak = incident.streak,
                window_count = incident.window_count,
                "critical incident: {}",
                incident.message
            );
        } else {
            warn!(
                target: "tally::incident",
                incident_id = %incident.id,
                scope = %incident.scope,
                kind = %c.kind,
                code = %c.code,
                streak = incident.streak,
                window_count = incident.window_count,
                "incident: {}",
                incident.message
            );
        }
        Ok(())
    }
}
