//! Tick scheduling and per-stream sync for plant-mirror-sync.

use crate::config::{StreamConfig, SyncConfig};
use crate::error::{Error, ErrorClass, Result};
use crate::mapper::map_batch;
use crate::metrics::{Metrics, StreamCounts, Timer};
use crate::mirror::MirrorStore;
use crate::source::{FetchPlan, PostgresSource, SourceConnector};
use crate::upsert::UpsertPlan;
use crate::watermark::Watermark;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Whether a tick is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Waiting for the next tick
    Idle,
    /// A tick is running
    Running,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorState::Idle => write!(f, "idle"),
            OrchestratorState::Running => write!(f, "running"),
        }
    }
}

/// Outcome of one stream within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Rows and watermark committed
    Committed,
    /// Nothing committed for this stream
    Failed,
}

/// Per-stream tick result.
#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    /// Stream key
    pub key: String,
    /// Target table
    pub target_table: String,
    /// Rows requested, as a readable description
    pub plan: Option<String>,
    /// Outcome
    pub status: StreamStatus,
    /// Rows returned by the source
    pub fetched: usize,
    /// Rows that reached the upsert
    pub mapped: usize,
    /// Rows inserted
    pub inserted: usize,
    /// Rows updated
    pub updated: usize,
    /// Rows unchanged
    pub unchanged: usize,
    /// Rows skipped for an incomplete natural key
    pub skipped: usize,
    /// Values coerced to null
    pub coerced: usize,
    /// Watermark read at the start of the stream
    pub watermark_before: Option<NaiveDateTime>,
    /// Watermark in force after the stream
    pub watermark_after: Option<NaiveDateTime>,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Error message if failed
    pub error: Option<String>,
    /// Error class if failed
    pub error_class: Option<ErrorClass>,
    /// Error code if failed
    pub error_code: Option<&'static str>,
}

impl StreamReport {
    fn new(stream: &StreamConfig) -> Self {
        Self {
            key: stream.key.clone(),
            target_table: stream.target_table.clone(),
            plan: None,
            status: StreamStatus::Failed,
            fetched: 0,
            mapped: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            coerced: 0,
            watermark_before: None,
            watermark_after: None,
            duration_ms: 0,
            error: None,
            error_class: None,
            error_code: None,
        }
    }

    fn fail(&mut self, err: &Error) {
        self.status = StreamStatus::Failed;
        self.error = Some(err.to_string());
        self.error_class = Some(err.class());
        self.error_code = Some(err.code());
        // the watermark did not move
        self.watermark_after = self.watermark_before;
    }

    /// Whether the stream committed.
    pub fn is_committed(&self) -> bool {
        self.status == StreamStatus::Committed
    }

    fn counts(&self) -> StreamCounts {
        StreamCounts {
            inserted: self.inserted as u64,
            updated: self.updated as u64,
            unchanged: self.unchanged as u64,
            skipped: self.skipped as u64,
            coerced: self.coerced as u64,
        }
    }
}

/// Result of one completed tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Plant business date the tick ran for
    pub business_date: NaiveDate,
    /// Per-stream results in execution order
    pub streams: Vec<StreamReport>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
}

impl TickReport {
    /// Check if every stream committed.
    pub fn all_committed(&self) -> bool {
        self.streams.iter().all(StreamReport::is_committed)
    }

    /// Report for a stream key.
    pub fn stream(&self, key: &str) -> Option<&StreamReport> {
        self.streams.iter().find(|s| s.key == key)
    }

    /// Streams that failed.
    pub fn failed(&self) -> impl Iterator<Item = &StreamReport> {
        self.streams.iter().filter(|s| !s.is_committed())
    }

    /// Rows written across all streams.
    pub fn total_written(&self) -> usize {
        self.streams.iter().map(|s| s.inserted + s.updated).sum()
    }
}

/// What happened when a tick was requested.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Another tick was still running; nothing was done
    Skipped,
    /// The tick ran
    Completed(TickReport),
}

impl TickOutcome {
    /// The report, if the tick ran.
    pub fn report(&self) -> Option<&TickReport> {
        match self {
            TickOutcome::Completed(report) => Some(report),
            TickOutcome::Skipped => None,
        }
    }
}

/// Per-stream mirror status for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct StreamState {
    /// Stream key
    pub key: String,
    /// Strategy
    pub strategy: String,
    /// Target table
    pub target_table: String,
    /// Rows in the target table, if it exists
    pub rows: Option<i64>,
    /// Committed watermark
    pub watermark: Option<Watermark>,
}

/// Clears the running flag when the tick ends, however it ends.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct Engine<S> {
    source: S,
    mirror: MirrorStore,
    watermark_table_ready: bool,
    ready_tables: HashSet<String>,
}

/// Runs the configured streams on a timer, one tick at a time.
pub struct Orchestrator<S> {
    config: SyncConfig,
    timezone: Tz,
    plans: HashMap<String, UpsertPlan>,
    running: AtomicBool,
    engine: Mutex<Engine<S>>,
    metrics: Metrics,
}

impl Orchestrator<PostgresSource> {
    /// Build an orchestrator over the configured source and mirror.
    ///
    /// The mirror is opened here; the source connects on first use.
    pub fn connect(config: SyncConfig) -> Result<Self> {
        let source = PostgresSource::new(config.source.clone(), config.retry.clone());
        let mirror = MirrorStore::open(config.mirror.clone())?;
        Self::new(config, source, mirror)
    }
}

impl<S: SourceConnector> Orchestrator<S> {
    /// Create an orchestrator from explicit parts.
    pub fn new(config: SyncConfig, source: S, mirror: MirrorStore) -> Result<Self> {
        config.validate()?;
        let timezone = config.schedule.timezone()?;
        let plans = config
            .streams
            .iter()
            .map(|s| (s.key.clone(), UpsertPlan::new(s)))
            .collect();

        Ok(Self {
            config,
            timezone,
            plans,
            running: AtomicBool::new(false),
            engine: Mutex::new(Engine {
                source,
                mirror,
                watermark_table_ready: false,
                ready_tables: HashSet::new(),
            }),
            metrics: Metrics::new(),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Collected metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Current state.
    pub fn state(&self) -> OrchestratorState {
        if self.running.load(Ordering::Acquire) {
            OrchestratorState::Running
        } else {
            OrchestratorState::Idle
        }
    }

    /// Plant business date for an instant.
    pub fn business_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    /// Run `f` against the mirror once no tick holds it.
    pub async fn with_mirror<R>(&self, f: impl FnOnce(&MirrorStore) -> R) -> R {
        let engine = self.engine.lock().await;
        f(&engine.mirror)
    }

    /// Test connectivity to both ends.
    pub async fn test_connectivity(&self) -> Result<()> {
        info!("Testing connectivity...");
        let mut engine = self.engine.lock().await;

        engine.source.ping().await?;
        info!("Source: OK");

        engine.mirror.ping()?;
        info!("Mirror: OK");
        Ok(())
    }

    /// Create the watermark table and every stream's target table.
    pub async fn prepare(&self) -> Result<()> {
        let mut engine = self.engine.lock().await;
        Self::ensure_watermark_table(&mut engine)?;
        for stream in self.config.ordered_streams() {
            Self::ensure_stream_table(&mut engine, stream)?;
        }
        Ok(())
    }

    /// Row counts and watermarks per configured stream.
    pub async fn status(&self) -> Result<Vec<StreamState>> {
        let engine = self.engine.lock().await;
        let mirror = &engine.mirror;

        let watermarks = if mirror.table_exists(crate::watermark::WATERMARK_TABLE)? {
            mirror.watermarks()?
        } else {
            Vec::new()
        };

        let mut states = Vec::with_capacity(self.config.streams.len());
        for stream in &self.config.streams {
            let rows = if mirror.table_exists(&stream.target_table)? {
                Some(mirror.count_rows(&stream.target_table)?)
            } else {
                None
            };
            states.push(StreamState {
                key: stream.key.clone(),
                strategy: stream.strategy.to_string(),
                target_table: stream.target_table.clone(),
                rows,
                watermark: watermarks.iter().find(|w| w.key == stream.key).cloned(),
            });
        }
        Ok(states)
    }

    /// Run one tick now.
    pub async fn tick(&self) -> TickOutcome {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as if the wall clock read `now`.
    ///
    /// Returns [`TickOutcome::Skipped`] immediately if a tick is already running.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickOutcome {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            warn!("Previous tick still running, skipping");
            self.metrics.record_skipped_tick();
            return TickOutcome::Skipped;
        };

        let business_date = self.business_date(now);
        let span = info_span!("tick", %business_date);
        let report = self.run_streams(now, business_date).instrument(span).await;
        TickOutcome::Completed(report)
    }

    async fn run_streams(&self, now: DateTime<Utc>, business_date: NaiveDate) -> TickReport {
        let timer = Timer::start("tick");
        let mut engine = self.engine.lock().await;

        let streams = self.config.ordered_streams();
        info!("Starting tick for {} streams", streams.len());

        let mut reports = Vec::with_capacity(streams.len());
        for stream in streams {
            let report = self
                .run_stream(&mut engine, stream, now, business_date)
                .await;
            self.metrics
                .record_stream(&report.key, report.is_committed(), report.counts());
            reports.push(report);
        }
        drop(engine);

        let duration_ms = timer.stop();
        self.metrics.record_tick(duration_ms);

        let report = TickReport {
            started_at: now,
            business_date,
            streams: reports,
            duration_ms,
        };

        if report.all_committed() {
            info!(
                "Tick completed in {}ms. Rows written: {}",
                duration_ms,
                report.total_written()
            );
        } else {
            warn!(
                "Tick completed with errors in {}ms. Rows written: {}, Failed streams: {}",
                duration_ms,
                report.total_written(),
                report.failed().count()
            );
        }
        report
    }

    /// Fetch, map and commit one stream. Never propagates: failures land in the report.
    #[instrument(skip_all, fields(stream = %stream.key))]
    async fn run_stream(
        &self,
        engine: &mut Engine<S>,
        stream: &StreamConfig,
        now: DateTime<Utc>,
        business_date: NaiveDate,
    ) -> StreamReport {
        let timer = Timer::start(format!("stream {}", stream.key));
        let mut report = StreamReport::new(stream);

        if let Err(e) = self.sync_stream(engine, stream, now, business_date, &mut report).await {
            report.fail(&e);
            error!(
                class = %e.class(),
                code = e.code(),
                rows = report.fetched,
                mapped = report.mapped,
                "Stream failed: {}", e
            );
        }

        report.duration_ms = timer.stop();
        report
    }

    async fn sync_stream(
        &self,
        engine: &mut Engine<S>,
        stream: &StreamConfig,
        now: DateTime<Utc>,
        business_date: NaiveDate,
        report: &mut StreamReport,
    ) -> Result<()> {
        Self::ensure_watermark_table(engine)?;
        Self::ensure_stream_table(engine, stream)?;

        let watermark = engine.mirror.watermark(&stream.key)?;
        report.watermark_before = watermark;

        let plan = FetchPlan::for_stream(stream, watermark, business_date);
        report.plan = Some(plan.to_string());
        debug!(strategy = %stream.strategy, %plan, "Fetching");

        let rows = engine.source.fetch(stream, &plan).await?;
        report.fetched = rows.len();

        let batch = map_batch(stream, &rows);
        report.mapped = batch.rows.len();
        report.skipped = batch.skipped;
        report.coerced = batch.coerced;

        let upsert = self.plans.get(&stream.key).ok_or_else(|| {
            Error::config(format!("No upsert plan prepared for stream '{}'", stream.key))
        })?;
        let outcome = engine
            .mirror
            .apply_batch(stream, upsert, &batch, now.naive_utc())?;

        report.inserted = outcome.stats.inserted;
        report.updated = outcome.stats.updated;
        report.unchanged = outcome.stats.unchanged;
        report.watermark_after = outcome.watermark;
        report.status = StreamStatus::Committed;

        info!(
            fetched = report.fetched,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            coerced = report.coerced,
            watermark = ?report.watermark_after,
            "Stream committed"
        );
        Ok(())
    }

    fn ensure_watermark_table(engine: &mut Engine<S>) -> Result<()> {
        if !engine.watermark_table_ready {
            engine.mirror.ensure_watermark_table()?;
            engine.watermark_table_ready = true;
        }
        Ok(())
    }

    fn ensure_stream_table(engine: &mut Engine<S>, stream: &StreamConfig) -> Result<()> {
        if !engine.ready_tables.contains(&stream.target_table) {
            engine.mirror.ensure_stream_table(stream)?;
            engine.ready_tables.insert(stream.target_table.clone());
        }
        Ok(())
    }
}

impl<S: SourceConnector + 'static> Orchestrator<S> {
    /// Tick immediately, then every configured interval, until `shutdown` resolves.
    ///
    /// Each tick runs as its own task; a tick that comes due while the previous
    /// one is still running is skipped, not queued. On shutdown the in-flight
    /// tick, if any, is allowed to finish.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let interval = self.config.schedule.interval()?;
        info!(
            "Scheduler started: every {}, timezone {}",
            humantime::format_duration(interval),
            self.timezone
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let TickOutcome::Completed(report) = this.tick().await {
                            debug!("Tick finished: {} streams", report.streams.len());
                        }
                    });
                }
            }
        }

        // wait for an in-flight tick to release the engine
        let _engine = self.engine.lock().await;
        info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use crate::mapper::SourceRow;
    use async_trait::async_trait;

    struct EmptySource;

    #[async_trait]
    impl SourceConnector for EmptySource {
        async fn ping(&mut self) -> Result<()> {
            Ok(())
        }

        async fn fetch(&mut self, _: &StreamConfig, _: &FetchPlan) -> Result<Vec<SourceRow>> {
            Ok(Vec::new())
        }
    }

    fn orchestrator(timezone: &str) -> Orchestrator<EmptySource> {
        let config = SyncConfig::builder()
            .source_url("postgres://reader@localhost/plant")
            .mirror_path(":memory:")
            .timezone(timezone)
            .build()
            .unwrap();
        let mirror = MirrorStore::open(MirrorConfig {
            path: ":memory:".into(),
            ..Default::default()
        })
        .unwrap();
        Orchestrator::new(config, EmptySource, mirror).unwrap()
    }

    #[test]
    fn test_run_guard() {
        let flag = AtomicBool::new(false);
        let guard = RunGuard::acquire(&flag).unwrap();
        assert!(RunGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(RunGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_business_date_uses_plant_timezone() {
        let orch = orchestrator("Asia/Jakarta");
        // 20:00 UTC is 03:00 the next day in Jakarta
        let now = DateTime::parse_from_rfc3339("2025-01-15T20:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            orch.business_date(now),
            NaiveDate::from_ymd_opt(2025, 1, 16).unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_tick_commits_every_stream() {
        let orch = orchestrator("UTC");
        let outcome = orch.tick().await;
        let report = outcome.report().unwrap();

        assert!(report.all_committed());
        let keys: Vec<&str> = report.streams.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["PLAN", "RESULT"]);
        assert_eq!(orch.state(), OrchestratorState::Idle);
        assert_eq!(orch.metrics().snapshot().ticks_total, 1);

        let states = orch.status().await.unwrap();
        assert_eq!(states[0].rows, Some(0));
        assert!(states[1].watermark.is_none());
    }

    #[test]
    fn test_report_serializes() {
        let report = TickReport {
            started_at: Utc::now(),
            business_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            streams: vec![],
            duration_ms: 3,
        };
        let json = serde_json::to_value(TickOutcome::Completed(report)).unwrap();
        assert_eq!(json["outcome"], "completed");
        let skipped = serde_json::to_value(TickOutcome::Skipped).unwrap();
        assert_eq!(skipped["outcome"], "skipped");
    }
}
