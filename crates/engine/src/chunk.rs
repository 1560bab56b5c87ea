//! Bounded-concurrency chunk processing.
//!
//! Every item of a chunk runs its own pipeline
//! (parse, read, apply, write, audit) as a spawned task. A semaphore caps the
//! number of pipelines in flight at `concurrency`; the call returns only once
//! every item has a terminal outcome. Item failures are classified into
//! [`ItemResult`]s and never abort the chunk.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use tally_core::config::ProcessingConfig;
use tally_core::{
    Chunk, ChunkResult, EntityStatistics, ItemOutcome, ItemResult, Record, StatisticsUpdate,
    TallyConfig, TallyError,
};
use tally_ingest::RecordProcessor;
use tally_retry::{with_retry, CircuitBreaker, RetryPolicy};
use tally_storage::{AuditEntry, AuditSink, EntityStatisticsStore, IncidentSink};

use crate::errors::ErrorHandlingService;

/// Identifies the chunk an item belongs to.
struct ChunkContext {
    chunk_id: String,
    execution_id: String,
}

/// Shared state for item pipelines. Cloned into each task via `Arc`.
#[derive(Clone)]
struct ItemPipeline {
    store: Arc<dyn EntityStatisticsStore>,
    audit: Arc<dyn AuditSink>,
    errors: Arc<ErrorHandlingService>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    records: RecordProcessor,
    optimistic: bool,
}

pub struct ChunkProcessor {
    pipeline: Arc<ItemPipeline>,
    processing: ProcessingConfig,
}

impl ChunkProcessor {
    pub fn new(
        config: &TallyConfig,
        store: Arc<dyn EntityStatisticsStore>,
        audit: Arc<dyn AuditSink>,
        incidents: Arc<dyn IncidentSink>,
    ) -> Self {
        let errors = Arc::new(ErrorHandlingService::new(config.escalation.clone(), incidents));
        let breaker = Arc::new(CircuitBreaker::new(
            "entity-statistics-store",
            config.circuit_breaker.clone(),
        ));
        Self {
            pipeline: Arc::new(ItemPipeline {
                store,
                audit,
                errors,
                breaker,
                retry: RetryPolicy::from_config(&config.retry),
                records: RecordProcessor::new(config.rules.clone()),
                optimistic: config.processing.optimistic_updates,
            }),
            processing: config.processing.clone(),
        }
    }

    /// Replace the store circuit breaker, e.g. to share one across processors.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.pipeline_mut().breaker = breaker;
        self
    }

    pub fn with_error_service(mut self, errors: Arc<ErrorHandlingService>) -> Self {
        self.pipeline_mut().errors = errors;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.pipeline_mut().retry = retry;
        self
    }

    fn pipeline_mut(&mut self) -> &mut ItemPipeline {
        Arc::make_mut(&mut self.pipeline)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.pipeline.breaker
    }

    pub fn error_service(&self) -> &Arc<ErrorHandlingService> {
        &self.pipeline.errors
    }

    /// Process every item of `chunk` and collect the outcomes.
    ///
    /// Fails only when the chunk itself is unacceptable (too many items).
    pub async fn process_chunk(&self, chunk: Chunk) -> Result<ChunkResult, TallyError> {
        let max = self.processing.max_batch_size;
        if chunk.len() > max {
            return Err(TallyError::ChunkTooLarge {
                size: chunk.len(),
                max,
            });
        }

        let started = Instant::now();
        let processed_count = chunk.len();
        let ctx = Arc::new(ChunkContext {
            chunk_id: chunk.chunk_id,
            execution_id: chunk.execution_id,
        });
        let limiter = Arc::new(Semaphore::new(self.processing.concurrency.max(1)));

        debug!(
            chunk_id = %ctx.chunk_id,
            items = processed_count,
            concurrency = self.processing.concurrency,
            "processing chunk"
        );

        let mut indices = Vec::with_capacity(processed_count);
        let mut handles = Vec::with_capacity(processed_count);
        for record in chunk.items {
            let item_index = record.index;
            let limiter = limiter.clone();
            let pipeline = self.pipeline.clone();
            let ctx = ctx.clone();
            let handle = tokio::spawn(async move {
                match limiter.acquire_owned().await {
                    Ok(_permit) => pipeline.run(&ctx, record).await,
                    Err(_) => {
                        let err = TallyError::Consistency("worker pool closed".to_string());
                        pipeline.fail(&ctx, item_index, None, Instant::now(), &err).await
                    }
                }
            });
            indices.push(item_index);
            handles.push(handle);
        }

        let joined = join_all(handles).await;

        let mut results = Vec::new();
        let mut errors = Vec::new();
        for (item_index, joined) in indices.into_iter().zip(joined) {
            let outcome = match joined {
                Ok(result) => result,
                Err(join_err) => {
                    let err = TallyError::Consistency(format!("item task aborted: {join_err}"));
                    self.pipeline
                        .fail(&ctx, item_index, None, started, &err)
                        .await
                }
            };
            match outcome.outcome {
                ItemOutcome::Success(_) => results.push(outcome),
                ItemOutcome::Error(_) => errors.push(outcome),
            }
        }

        let error_summary = self
            .pipeline
            .errors
            .summarize(errors.iter().filter_map(ItemResult::error));

        let result = ChunkResult {
            chunk_id: ctx.chunk_id.clone(),
            batch_index: chunk.batch_index,
            execution_id: ctx.execution_id.clone(),
            processed_count,
            success_count: results.len(),
            error_count: errors.len(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            results,
            errors,
            error_summary,
        };

        info!(
            chunk_id = %result.chunk_id,
            batch_index = result.batch_index,
            processed = result.processed_count,
            succeeded = result.success_count,
            failed = result.error_count,
            elapsed_ms = result.processing_time_ms,
            "chunk processed"
        );
        if result.error_ratio() > self.processing.error_tolerance {
            warn!(
                chunk_id = %result.chunk_id,
                error_ratio = result.error_ratio(),
                tolerance = self.processing.error_tolerance,
                "chunk error ratio above tolerance"
            );
        }

        Ok(result)
    }
}

impl ItemPipeline {
    async fn run(&self, ctx: &ChunkContext, record: Record) -> ItemResult {
        let started = Instant::now();
        let entity_id = self.records.entity_id_of(&record).map(str::to_string);

        match self.apply(ctx, &record).await {
            Ok(update) => ItemResult {
                item_index: record.index,
                entity_id,
                processing_time_ms: started.elapsed().as_millis() as u64,
                outcome: ItemOutcome::Success(update),
            },
            Err(err) => self.fail(ctx, record.index, entity_id, started, &err).await,
        }
    }

    async fn fail(
        &self,
        ctx: &ChunkContext,
        item_index: usize,
        entity_id: Option<String>,
        started: Instant,
        err: &TallyError,
    ) -> ItemResult {
        warn!(
            chunk_id = %ctx.chunk_id,
            item_index,
            entity_id = entity_id.as_deref().unwrap_or("-"),
            error = %err,
            "item failed"
        );
        let error = self.errors.handle(&ctx.execution_id, err).await;
        ItemResult {
            item_index,
            entity_id,
            processing_time_ms: started.elapsed().as_millis() as u64,
            outcome: ItemOutcome::Error(error),
        }
    }

    async fn apply(&self, ctx: &ChunkContext, record: &Record) -> Result<StatisticsUpdate, TallyError> {
        let instruction = self.records.to_instruction(record)?;
        let entity_id = instruction.entity_id.as_str();

        let current = with_retry(&self.retry, || {
            self.breaker.call(|| self.store.get(entity_id))
        })
        .await?
        .unwrap_or_else(|| EntityStatistics::empty(entity_id));

        let updated = self
            .records
            .apply_instruction(&current, &instruction, &ctx.execution_id)?;

        let expected_version = self.optimistic.then_some(current.version);
        let written = with_retry(&self.retry, || {
            self.breaker
                .call(|| self.store.put(updated.clone(), expected_version))
        })
        .await?;

        self.audit(ctx, record.index, &current, &written).await;

        Ok(StatisticsUpdate {
            previous: current.counters,
            updated: written.counters,
            version: written.version,
        })
    }

    /// Best-effort: failures are logged, never returned.
    async fn audit(
        &self,
        ctx: &ChunkContext,
        item_index: usize,
        previous: &EntityStatistics,
        written: &EntityStatistics,
    ) {
        let entry = AuditEntry {
            execution_id: ctx.execution_id.clone(),
            chunk_id: ctx.chunk_id.clone(),
            item_index,
            entity_id: written.entity_id.clone(),
            previous: previous.counters.clone(),
            updated: written.counters.clone(),
            version: written.version,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.audit.append(entry).await {
            warn!(
                chunk_id = %ctx.chunk_id,
                item_index,
                entity_id = %written.entity_id,
                error = %e,
                "audit append failed"
            );
        }
    }
}
