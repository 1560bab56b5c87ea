//! Collaborator interfaces consumed by the chunk processor, plus in-process
//! implementations used by the worker binary and tests.

pub mod memory;
pub mod sinks;
pub mod traits;

pub use memory::{InMemoryAuditSink, InMemoryIncidentSink, InMemoryStatisticsStore};
pub use sinks::{LogAuditSink, LogIncidentSink};
pub use traits::{AuditEntry, AuditSink, EntityStatisticsStore, Incident, IncidentSink};
