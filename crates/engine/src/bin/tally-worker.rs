//! tally-worker: apply a delimited file of counter increments.
//!
//! Validates the whole batch, splits valid records into chunks of
//! `max_batch_size`, runs each chunk through the [`ChunkProcessor`] against an
//! in-process store, and prints the aggregated result as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use tally_core::config::load_dotenv;
use tally_core::{Chunk, TallyConfig};
use tally_engine::{AggregatedResult, ChunkProcessor, ResultAggregator};
use tally_ingest::{read_delimited, BatchSchema, RecordValidator, ValidationIssue};
use tally_storage::{InMemoryStatisticsStore, LogAuditSink, LogIncidentSink};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tally-worker", version, about)]
struct Cli {
    /// Delimited input file with a header row.
    #[arg(long, env = "TALLY_INPUT")]
    input: PathBuf,

    /// Field delimiter.
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// Execution id; generated when omitted.
    #[arg(long, env = "TALLY_EXECUTION_ID")]
    execution_id: Option<String>,
}

#[derive(Serialize)]
struct Output {
    config: serde_json::Value,
    validation: ValidationSummary,
    result: AggregatedResult,
}

#[derive(Serialize)]
struct ValidationSummary {
    total_records: usize,
    valid_records: usize,
    invalid_records: usize,
    suppressed_errors: usize,
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let config = TallyConfig::from_env();
    config.validate().context("invalid configuration")?;
    config.log_summary();

    let execution_id = cli
        .execution_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let text = tokio::fs::read_to_string(&cli.input)
        .await
        .with_context(|| format!("reading {}", cli.input.display()))?;
    let (headers, records) = read_delimited(&text, cli.delimiter)?;

    let validator = RecordValidator::new(config.rules.clone());
    let schema = BatchSchema::from_rules(&config.rules);
    let report = validator.validate_batch(&headers, &records, &schema)?;
    info!(
        execution_id = %execution_id,
        total = report.total_records,
        valid = report.valid.len(),
        invalid = report.invalid_count(),
        warnings = report.warnings.len(),
        "batch validated"
    );
    if report.is_truncated() {
        warn!(
            suppressed = report.suppressed_errors,
            "validation error list truncated"
        );
    }

    let processor = ChunkProcessor::new(
        &config,
        Arc::new(InMemoryStatisticsStore::new()),
        Arc::new(LogAuditSink),
        Arc::new(LogIncidentSink),
    );

    let started = Instant::now();
    let batch_size = config.processing.max_batch_size.max(1);
    let mut chunk_results = Vec::new();
    for (batch_index, items) in report.valid.chunks(batch_size).enumerate() {
        let chunk = Chunk::new(
            format!("{execution_id}-{batch_index}"),
            batch_index,
            execution_id.clone(),
            items.to_vec(),
        );
        chunk_results.push(processor.process_chunk(chunk).await?);
    }

    let aggregator = ResultAggregator::new(config.aggregation.clone());
    let result = aggregator.aggregate_over(&execution_id, &chunk_results, started.elapsed());
    processor.error_service().tracker().forget_scope(&execution_id);

    let output = Output {
        config: config.summary(),
        validation: ValidationSummary {
            total_records: report.total_records,
            valid_records: report.valid.len(),
            invalid_records: report.invalid_count(),
            suppressed_errors: report.suppressed_errors,
            errors: report.errors,
            warnings: report.warnings,
        },
        result,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
