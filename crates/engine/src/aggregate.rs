//! Execution-level roll-up of chunk results.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tally_core::config::AggregationConfig;
use tally_core::{ChunkResult, TallyError};

const TOP_ERRORS: usize = 10;
const MAX_RECOMMENDATIONS: usize = 5;
const FALLBACK_RECOMMENDATION: &str =
    "Unable to derive recommendations; review the processing logs for this execution";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkTiming {
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrequency {
    pub code: String,
    pub count: u64,
    /// Share of all errors, in percent.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub execution_id: String,
    pub total_chunks: usize,
    pub total_processed: usize,
    pub total_success: usize,
    pub total_errors: usize,
    /// Percent, rounded to 2 decimals.
    pub success_rate: f64,
    /// Percent, rounded to 2 decimals.
    pub error_rate: f64,
    /// Records per second over the execution wall-clock time.
    pub throughput: f64,
    pub wall_clock_ms: u64,
    pub chunk_timing: ChunkTiming,
    pub errors_by_type: BTreeMap<String, u64>,
    /// Most frequent error codes, highest first.
    pub top_errors: Vec<ErrorFrequency>,
    pub critical_errors: usize,
    pub recommendations: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 / whole as f64 * 100.0)
    }
}

pub struct ResultAggregator {
    config: AggregationConfig,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new(AggregationConfig::default())
    }
}

impl ResultAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    /// Aggregate chunks processed one after another; wall-clock time is the
    /// sum of the chunk processing times.
    pub fn aggregate(&self, execution_id: &str, chunks: &[ChunkResult]) -> AggregatedResult {
        let total_ms: u64 = chunks.iter().map(|c| c.processing_time_ms).sum();
        self.aggregate_over(execution_id, chunks, Duration::from_millis(total_ms))
    }

    /// Aggregate with an externally measured wall-clock duration, for chunks
    /// that ran in parallel.
    pub fn aggregate_over(
        &self,
        execution_id: &str,
        chunks: &[ChunkResult],
        wall_clock: Duration,
    ) -> AggregatedResult {
        let total_processed: usize = chunks.iter().map(|c| c.processed_count).sum();
        let total_success: usize = chunks.iter().map(|c| c.success_count).sum();
        let total_errors: usize = chunks.iter().map(|c| c.error_count).sum();

        // Clamp to 1ms so an instant run does not divide by zero.
        let elapsed_secs = wall_clock.max(Duration::from_millis(1)).as_secs_f64();
        let throughput = round2(total_processed as f64 / elapsed_secs);

        let chunk_timing = timing(chunks);

        let mut errors_by_type: BTreeMap<String, u64> = BTreeMap::new();
        let mut critical_errors = 0;
        for chunk in chunks {
            for item in &chunk.errors {
                if let Some(e) = item.error() {
                    *errors_by_type.entry(e.code().to_string()).or_insert(0) += 1;
                    if e.classification.is_critical() {
                        critical_errors += 1;
                    }
                }
            }
        }
        let top_errors = rank(&errors_by_type);

        let mut result = AggregatedResult {
            execution_id: execution_id.to_string(),
            total_chunks: chunks.len(),
            total_processed,
            total_success,
            total_errors,
            success_rate: percent(total_success, total_processed),
            error_rate: percent(total_errors, total_processed),
            throughput,
            wall_clock_ms: wall_clock.as_millis() as u64,
            chunk_timing,
            errors_by_type,
            top_errors,
            critical_errors,
            recommendations: Vec::new(),
            completed_at: Utc::now(),
        };

        result.recommendations = match self.recommend(&result) {
            Ok(recs) => recs,
            Err(e) => {
                warn!(execution_id, error = %e, "recommendation generation failed");
                vec![FALLBACK_RECOMMENDATION.to_string()]
            }
        };

        info!(
            execution_id,
            chunks = result.total_chunks,
            processed = result.total_processed,
            errors = result.total_errors,
            error_rate = result.error_rate,
            throughput = result.throughput,
            "execution aggregated"
        );

        result
    }

    fn recommend(&self, r: &AggregatedResult) -> Result<Vec<String>, TallyError> {
        if !r.error_rate.is_finite() || !r.throughput.is_finite() {
            return Err(TallyError::Consistency(format!(
                "non-finite metrics: error_rate={}, throughput={}",
                r.error_rate, r.throughput
            )));
        }

        let cfg = &self.config;
        let mut recs = Vec::new();

        if r.error_rate > cfg.critical_error_rate {
            recs.push(format!(
                "Critical: error rate {:.2}% exceeds {:.2}%; investigate before re-running",
                r.error_rate, cfg.critical_error_rate
            ));
        } else if r.error_rate > cfg.review_error_rate {
            recs.push(format!(
                "Review error rate: {:.2}% exceeds {:.2}%",
                r.error_rate, cfg.review_error_rate
            ));
        }

        if r.critical_errors > 0 {
            recs.push(format!(
                "{} critical error(s) detected (data corruption, security or out-of-memory); escalate to on-call",
                r.critical_errors
            ));
        }

        if let Some(top) = r.top_errors.first() {
            if top.percentage > cfg.dominant_error_share {
                recs.push(format!(
                    "{} accounts for {:.2}% of errors; address it first",
                    top.code, top.percentage
                ));
            }
        }

        if r.total_processed > 0 && r.throughput < cfg.min_throughput {
            recs.push(format!(
                "Throughput {:.2} records/s is below {:.2}; tune concurrency or batch size",
                r.throughput, cfg.min_throughput
            ));
        }

        if recs.is_empty() {
            recs.push("Processing completed within normal parameters".to_string());
        }
        recs.truncate(MAX_RECOMMENDATIONS);
        Ok(recs)
    }
}

fn timing(chunks: &[ChunkResult]) -> ChunkTiming {
    let times: Vec<u64> = chunks.iter().map(|c| c.processing_time_ms).collect();
    match (times.iter().min(), times.iter().max()) {
        (Some(&min_ms), Some(&max_ms)) => ChunkTiming {
            min_ms,
            max_ms,
            avg_ms: round2(times.iter().sum::<u64>() as f64 / times.len() as f64),
        },
        _ => ChunkTiming::default(),
    }
}

fn rank(errors_by_type: &BTreeMap<String, u64>) -> Vec<ErrorFrequency> {
    let total: u64 = errors_by_type.values().sum();
    let mut ranked: Vec<ErrorFrequency> = errors_by_type
        .iter()
        .map(|(code, &count)| ErrorFrequency {
            code: code.clone(),
            count,
            percentage: if total == 0 {
                0.0
            } else {
                round2(count as f64 / total as f64 * 100.0)
            },
        })
        .collect();
    // Stable sort keeps ties in code order.
    ranked.sort_by(|a, b| b.count.cmp(&a.count));
    ranked.truncate(TOP_ERRORS);
    ranked
}
