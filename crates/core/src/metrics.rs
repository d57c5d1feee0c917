use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smoothing factor for the processing-time moving average.
pub const EMA_ALPHA: f64 = 0.1;

/// Exponential-moving-average bookkeeping for a node.
#[derive(Debug, Clone, Default)]
pub struct NodeMetrics {
    avg_processing_ms: f64,
    samples: u64,
}

/// Metrics as reported in a status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub avg_processing_ms: f64,
    /// `processed / (processed + errors)`; 1.0 before any outcome is recorded.
    pub success_rate: f64,
    /// Processed tasks per minute of uptime.
    pub throughput: f64,
}

impl NodeMetrics {
    /// Fold one execution time into the average. The first sample seeds it.
    pub fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_processing_ms = if self.samples == 0 {
            ms
        } else {
            self.avg_processing_ms * (1.0 - EMA_ALPHA) + ms * EMA_ALPHA
        };
        self.samples += 1;
    }

    pub fn avg_processing_ms(&self) -> f64 {
        self.avg_processing_ms
    }

    pub fn snapshot(&self, total_processed: u64, total_errors: u64, uptime: Duration) -> MetricsSnapshot {
        let outcomes = total_processed + total_errors;
        let success_rate = if outcomes == 0 {
            1.0
        } else {
            total_processed as f64 / outcomes as f64
        };
        let minutes = uptime.as_secs_f64() / 60.0;
        let throughput = if minutes > 0.0 {
            total_processed as f64 / minutes
        } else {
            0.0
        };
        MetricsSnapshot {
            avg_processing_ms: self.avg_processing_ms,
            success_rate,
            throughput,
        }
    }
}
