//! Metrics and observability for plant-mirror-sync.
//!
//! Counters are kept in-process (for `status` output and tests) and also
//! emitted through the `metrics` facade for whatever recorder the host installs.

use std::sync::atomic::{AtomicU64, Ordering};

use std::time::Instant;

/// Metrics collector for sync ticks.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Ticks that ran
    pub ticks_total: AtomicU64,
    /// Ticks skipped because one was already running
    pub ticks_skipped: AtomicU64,
    /// Stream runs that committed
    pub streams_succeeded: AtomicU64,
    /// Stream runs that failed
    pub streams_failed: AtomicU64,
    /// Rows inserted into the mirror
    pub rows_inserted: AtomicU64,
    /// Rows updated in the mirror
    pub rows_updated: AtomicU64,
    /// Rows that matched the mirror exactly
    pub rows_unchanged: AtomicU64,
    /// Rows skipped for an incomplete natural key
    pub rows_skipped: AtomicU64,
    /// Values coerced to null
    pub values_coerced: AtomicU64,
    /// Total tick duration in milliseconds
    pub tick_duration_ms: AtomicU64,
}

/// Per-stream counts fed into [`Metrics::record_stream`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamCounts {
    /// Inserted rows
    pub inserted: u64,
    /// Updated rows
    pub updated: u64,
    /// Unchanged rows
    pub unchanged: u64,
    /// Skipped rows
    pub skipped: u64,
    /// Coerced values
    pub coerced: u64,
}

impl Metrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished tick.
    pub fn record_tick(&self, duration_ms: u64) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.tick_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        ::metrics::counter!("mirror_sync_ticks_total").increment(1);
        ::metrics::histogram!("mirror_sync_tick_duration_ms").record(duration_ms as f64);
    }

    /// Record a tick skipped by the overlap guard.
    pub fn record_skipped_tick(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("mirror_sync_ticks_skipped_total").increment(1);
    }

    /// Record one stream's outcome.
    pub fn record_stream(&self, stream: &str, success: bool, counts: StreamCounts) {
        if success {
            self.streams_succeeded.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("mirror_sync_stream_success_total", "stream" => stream.to_string())
                .increment(1);
        } else {
            self.streams_failed.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("mirror_sync_stream_failure_total", "stream" => stream.to_string())
                .increment(1);
        }

        self.rows_inserted.fetch_add(counts.inserted, Ordering::Relaxed);
        self.rows_updated.fetch_add(counts.updated, Ordering::Relaxed);
        self.rows_unchanged.fetch_add(counts.unchanged, Ordering::Relaxed);
        self.rows_skipped.fetch_add(counts.skipped, Ordering::Relaxed);
        self.values_coerced.fetch_add(counts.coerced, Ordering::Relaxed);

        ::metrics::counter!("mirror_sync_rows_inserted_total", "stream" => stream.to_string())
            .increment(counts.inserted);
        ::metrics::counter!("mirror_sync_rows_updated_total", "stream" => stream.to_string())
            .increment(counts.updated);
        ::metrics::counter!("mirror_sync_rows_unchanged_total", "stream" => stream.to_string())
            .increment(counts.unchanged);
        ::metrics::counter!("mirror_sync_rows_skipped_total", "stream" => stream.to_string())
            .increment(counts.skipped);
        ::metrics::counter!("mirror_sync_values_coerced_total", "stream" => stream.to_string())
            .increment(counts.coerced);
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            streams_succeeded: self.streams_succeeded.load(Ordering::Relaxed),
            streams_failed: self.streams_failed.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            rows_updated: self.rows_updated.load(Ordering::Relaxed),
            rows_unchanged: self.rows_unchanged.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            values_coerced: self.values_coerced.load(Ordering::Relaxed),
            tick_duration_ms: self.tick_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Ticks that ran
    pub ticks_total: u64,
    /// Ticks skipped
    pub ticks_skipped: u64,
    /// Stream runs that committed
    pub streams_succeeded: u64,
    /// Stream runs that failed
    pub streams_failed: u64,
    /// Rows inserted
    pub rows_inserted: u64,
    /// Rows updated
    pub rows_updated: u64,
    /// Rows unchanged
    pub rows_unchanged: u64,
    /// Rows skipped
    pub rows_skipped: u64,
    /// Values coerced to null
    pub values_coerced: u64,
    /// Total tick duration in milliseconds
    pub tick_duration_ms: u64,
}

impl MetricsSnapshot {
    /// Share of stream runs that committed.
    pub fn success_rate(&self) -> f64 {
        let total = self.streams_succeeded + self.streams_failed;
        if total == 0 {
            0.0
        } else {
            self.streams_succeeded as f64 / total as f64
        }
    }

    /// Calculate average tick duration.
    pub fn avg_tick_duration_ms(&self) -> f64 {
        if self.ticks_total == 0 {
            0.0
        } else {
            self.tick_duration_ms as f64 / self.ticks_total as f64
        }
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Start a new timer.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop timer and log duration.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
        elapsed
    }
}
