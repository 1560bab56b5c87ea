//! Chunk processing engine: bounded-concurrency item pipelines, error
//! handling with escalation, and execution-level result aggregation.

pub mod aggregate;
pub mod chunk;
pub mod errors;

pub use aggregate::{AggregatedResult, ChunkTiming, ErrorFrequency, ResultAggregator};
pub use chunk::ChunkProcessor;
pub use errors::{Escalation, EscalationTracker, ErrorHandlingService};
