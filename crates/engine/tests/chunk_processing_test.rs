//! Integration tests for chunk processing against in-process collaborators.
//!
//! These tests cover partial-failure results, the concurrency cap, retry of
//! transient store failures, the store circuit breaker, optimistic
//! version-checked writes, and isolation of an item whose task panics.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tally_core::config::CircuitBreakerConfig;
use tally_core::{
    Chunk, EntityStatistics, ErrorKind, ItemStatus, ManualClock, Record, TallyConfig, TallyError,
};
use tally_engine::ChunkProcessor;
use tally_retry::{CircuitBreaker, CircuitStatus, RetryPolicy};
use tally_storage::{
    EntityStatisticsStore, InMemoryAuditSink, InMemoryIncidentSink, InMemoryStatisticsStore,
};

fn record(index: usize, entity: &str, a: &str, b: &str) -> Record {
    Record::from_pairs(
        index,
        [("entityId", entity), ("counterA", a), ("counterB", b)],
    )
}

fn processor_with(config: &TallyConfig, store: Arc<dyn EntityStatisticsStore>) -> ChunkProcessor {
    ChunkProcessor::new(
        config,
        store,
        Arc::new(InMemoryAuditSink::new()),
        Arc::new(InMemoryIncidentSink::new()),
    )
}

// ── Stores ──────────────────────────────────────────────────────────

/// Counts concurrent in-flight calls and records the peak.
#[derive(Default)]
struct InstrumentedStore {
    inner: InMemoryStatisticsStore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl InstrumentedStore {
    async fn track<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let out = fut.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[async_trait]
impl EntityStatisticsStore for InstrumentedStore {
    async fn get(&self, entity_id: &str) -> Result<Option<EntityStatistics>, TallyError> {
        self.track(self.inner.get(entity_id)).await
    }

    async fn put(
        &self,
        stats: EntityStatistics,
        expected_version: Option<u64>,
    ) -> Result<EntityStatistics, TallyError> {
        self.track(self.inner.put(stats, expected_version)).await
    }
}

/// Fails reads while `down` is set.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStatisticsStore,
    down: AtomicBool,
    /// Remaining reads that fail with a timeout before succeeding.
    transient_failures: AtomicU32,
    gets: AtomicU32,
}

#[async_trait]
impl EntityStatisticsStore for FlakyStore {
    async fn get(&self, entity_id: &str) -> Result<Option<EntityStatistics>, TallyError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(TallyError::Connection("connection refused".into()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TallyError::Timeout(2_000));
        }
        self.inner.get(entity_id).await
    }

    async fn put(
        &self,
        stats: EntityStatistics,
        expected_version: Option<u64>,
    ) -> Result<EntityStatistics, TallyError> {
        self.inner.put(stats, expected_version).await
    }
}

/// Yields on every read so concurrent items interleave between read and write.
#[derive(Default)]
struct YieldingStore {
    inner: InMemoryStatisticsStore,
}

#[async_trait]
impl EntityStatisticsStore for YieldingStore {
    async fn get(&self, entity_id: &str) -> Result<Option<EntityStatistics>, TallyError> {
        let current = self.inner.get(entity_id).await;
        tokio::task::yield_now().await;
        current
    }

    async fn put(
        &self,
        stats: EntityStatistics,
        expected_version: Option<u64>,
    ) -> Result<EntityStatistics, TallyError> {
        self.inner.put(stats, expected_version).await
    }
}

/// Panics on reads of one entity; everything else goes to the inner store.
struct PanickingStore {
    inner: InMemoryStatisticsStore,
    poisoned_entity: &'static str,
}

#[async_trait]
impl EntityStatisticsStore for PanickingStore {
    async fn get(&self, entity_id: &str) -> Result<Option<EntityStatistics>, TallyError> {
        if entity_id == self.poisoned_entity {
            panic!("store driver crashed reading {entity_id}");
        }
        self.inner.get(entity_id).await
    }

    async fn put(
        &self,
        stats: EntityStatistics,
        expected_version: Option<u64>,
    ) -> Result<EntityStatistics, TallyError> {
        self.inner.put(stats, expected_version).await
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn mixed_chunk_reports_partial_failure() {
    let store = Arc::new(InMemoryStatisticsStore::new());
    let processor = processor_with(&TallyConfig::default(), store.clone());

    let chunk = Chunk::new(
        "chunk-0",
        0,
        "exec-1",
        vec![
            record(0, "U00001", "1", "0"),
            record(1, "INVALID", "1", "0"),
            record(2, "U00002", "0", "0"),
        ],
    );
    let result = processor.process_chunk(chunk).await.unwrap();

    assert_eq!(result.processed_count, 3);
    assert_eq!(result.success_count, 1);
    assert_eq!(result.error_count, 2);
    assert_eq!(result.chunk_id, "chunk-0");
    assert_eq!(result.execution_id, "exec-1");

    let ok = result.item(0).unwrap();
    assert_eq!(ok.status(), ItemStatus::Success);
    assert_eq!(ok.update().unwrap().updated["counterA"], 1);

    let bad_id = result.item(1).unwrap().error().unwrap();
    assert_eq!(bad_id.kind(), ErrorKind::Business);
    assert_eq!(bad_id.code(), "VALIDATION_ERROR");
    assert!(bad_id.message.contains("entityId"));

    let zero = result.item(2).unwrap().error().unwrap();
    assert_eq!(zero.kind(), ErrorKind::Business);
    assert_eq!(zero.code(), "BUSINESS_RULE_VIOLATION");
    assert!(!zero.retryable());

    // Only the successful item reached the store.
    let stored = store.snapshot();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].entity_id, "U00001");
    assert_eq!(stored[0].version, 1);
}

#[tokio::test(start_paused = true)]
async fn never_more_than_five_pipelines_in_flight() {
    let store = Arc::new(InstrumentedStore::default());
    let processor = processor_with(&TallyConfig::default(), store.clone());

    let items = (0..25)
        .map(|i| record(i, &format!("U{:05}", i + 1), "1", "1"))
        .collect();
    let result = processor
        .process_chunk(Chunk::new("chunk-0", 0, "exec-1", items))
        .await
        .unwrap();

    assert_eq!(result.success_count, 25);
    let peak = store.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak in-flight was {peak}");
    assert!(peak > 1, "items did not run concurrently");
    assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_store_failures_are_retried() {
    let store = Arc::new(FlakyStore::default());
    store.transient_failures.store(2, Ordering::SeqCst);
    let processor = processor_with(&TallyConfig::default(), store.clone());

    let result = processor
        .process_chunk(Chunk::new("chunk-0", 0, "exec-1", vec![record(0, "U00001", "4", "0")]))
        .await
        .unwrap();

    assert_eq!(result.success_count, 1);
    assert_eq!(store.gets.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_infrastructure_error() {
    let store = Arc::new(FlakyStore::default());
    store.transient_failures.store(10, Ordering::SeqCst);
    let processor = processor_with(&TallyConfig::default(), store.clone());

    let result = processor
        .process_chunk(Chunk::new("chunk-0", 0, "exec-1", vec![record(0, "U00001", "4", "0")]))
        .await
        .unwrap();

    let err = result.errors[0].error().unwrap();
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert_eq!(err.code(), "TIMEOUT");
    assert!(err.retryable());
    assert_eq!(store.gets.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn open_circuit_stops_calling_the_store() {
    let mut config = TallyConfig::default();
    config.processing.concurrency = 1;

    let clock = ManualClock::new();
    let breaker = Arc::new(CircuitBreaker::with_clock(
        "entity-statistics-store",
        CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_max_attempts: 1,
        },
        Arc::new(clock.clone()),
    ));

    let store = Arc::new(FlakyStore::default());
    store.down.store(true, Ordering::SeqCst);
    let processor = processor_with(&config, store.clone())
        .with_breaker(breaker.clone())
        .with_retry_policy(RetryPolicy::no_retry());

    let items = (0..8)
        .map(|i| record(i, &format!("U{:05}", i + 1), "1", "0"))
        .collect();
    let result = processor
        .process_chunk(Chunk::new("chunk-0", 0, "exec-1", items))
        .await
        .unwrap();

    assert_eq!(result.error_count, 8);
    assert_eq!(store.gets.load(Ordering::SeqCst), 5);
    assert_eq!(result.error_summary.errors_by_type["CONNECTION_ERROR"], 5);
    assert_eq!(result.error_summary.errors_by_type["CIRCUIT_OPEN"], 3);
    assert_eq!(breaker.status(), CircuitStatus::Open);

    // Dependency recovers; after the reset timeout one probe closes the circuit.
    store.down.store(false, Ordering::SeqCst);
    clock.advance(Duration::from_millis(30_000));

    let result = processor
        .process_chunk(Chunk::new("chunk-1", 1, "exec-1", vec![record(8, "U00009", "1", "0")]))
        .await
        .unwrap();
    assert_eq!(result.success_count, 1);
    assert_eq!(breaker.status(), CircuitStatus::Closed);
}

#[tokio::test]
async fn panicking_item_is_isolated_from_the_rest_of_the_chunk() {
    let store = Arc::new(PanickingStore {
        inner: InMemoryStatisticsStore::new(),
        poisoned_entity: "U00002",
    });
    let processor = processor_with(&TallyConfig::default(), store.clone());

    let items = (0..4)
        .map(|i| record(i, &format!("U{:05}", i + 1), "1", "0"))
        .collect();
    let result = processor
        .process_chunk(Chunk::new("chunk-0", 0, "exec-1", items))
        .await
        .unwrap();

    assert_eq!(result.processed_count, 4);
    assert_eq!(result.success_count, 3);
    assert_eq!(result.error_count, 1);
    assert_eq!(
        result.processed_count,
        result.success_count + result.error_count
    );

    let crashed = result.item(1).unwrap();
    assert_eq!(crashed.status(), ItemStatus::Error);
    let err = crashed.error().unwrap();
    assert_eq!(err.code(), "CONSISTENCY_ERROR");
    assert_eq!(err.kind(), ErrorKind::System);
    for index in [0, 2, 3] {
        assert_eq!(result.item(index).unwrap().status(), ItemStatus::Success);
    }
    assert_eq!(store.inner.snapshot().len(), 3);

    // The crashed call was counted once; the breaker still admits calls.
    assert_eq!(processor.breaker().status(), CircuitStatus::Closed);
    let next = processor
        .process_chunk(Chunk::new("chunk-1", 1, "exec-1", vec![record(4, "U00005", "1", "0")]))
        .await
        .unwrap();
    assert_eq!(next.success_count, 1);
}

#[tokio::test]
async fn optimistic_updates_reject_concurrent_writes_to_one_entity() {
    let mut config = TallyConfig::default();
    config.processing.optimistic_updates = true;

    let store = Arc::new(YieldingStore::default());
    let processor = processor_with(&config, store.clone());

    let chunk = Chunk::new(
        "chunk-0",
        0,
        "exec-1",
        vec![record(0, "U00001", "1", "0"), record(1, "U00001", "1", "0")],
    );
    let result = processor.process_chunk(chunk).await.unwrap();

    assert_eq!(result.success_count, 1);
    assert_eq!(result.error_count, 1);
    let conflict = result.errors[0].error().unwrap();
    assert_eq!(conflict.code(), "CONFLICT");
    assert_eq!(conflict.kind(), ErrorKind::System);
    assert!(!conflict.retryable());

    let stored = store.inner.get("U00001").await.unwrap().unwrap();
    assert_eq!(stored.counter("counterA"), 1);
    assert_eq!(stored.version, 1);
}
