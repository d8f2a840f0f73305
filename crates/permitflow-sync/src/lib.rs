//! Ingestion orchestration: source registry, environment configuration,
//! per-source incremental runs, and scheduling.

mod sink;
mod watermark;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use permitflow_adapters::{adapter_for_source, within_window, AdapterContext, AdapterError};
use permitflow_core::{ConfigError, GeoBounds, SourceConfig, SourceKind};
use permitflow_transport::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use sink::{
    deliver, ChunkOutcome, DeliveryError, DeliveryReport, DeliverySink, MemorySink, PgSink,
    UpsertBatch, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, PERMITS_TABLE,
};
pub use watermark::{
    cursor_from, gap_buffer, FileWatermarkStore, MemoryWatermarkStore, PgWatermarkStore,
    WatermarkError, WatermarkStore, GAP_BUFFER_SECS,
};

pub const CRATE_NAME: &str = "permitflow-sync";

pub const DEFAULT_FALLBACK_DAYS: u32 = 7;
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";
pub const DEFAULT_SOURCES_PATH: &str = "./sources.yaml";
pub const DEFAULT_STATE_FILE: &str = "./state/watermarks.json";
pub const MAX_DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::DuplicateSource(source.id.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == source_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    Postgres,
    File,
    Memory,
}

impl FromStr for StateBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StateBackend::Postgres),
            "file" | "json" => Ok(StateBackend::File),
            "memory" => Ok(StateBackend::Memory),
            other => Err(format!("expected postgres, file or memory, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkBackend {
    Postgres,
    Memory,
}

impl FromStr for SinkBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(SinkBackend::Postgres),
            "memory" => Ok(SinkBackend::Memory),
            other => Err(format!("expected postgres or memory, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub sources_path: PathBuf,
    pub state_backend: StateBackend,
    pub state_file: PathBuf,
    pub sink_backend: SinkBackend,
    pub chunk_size: usize,
    pub isolate_failures: bool,
    pub max_concurrency: Option<usize>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub fallback_days: u32,
    pub max_pages: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub bounds: GeoBounds,
}

fn invalid(key: &str, message: impl fmt::Display) -> ConfigError {
    ConfigError::InvalidSetting {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_setting<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(value) => value.trim().parse().map(Some).map_err(|e| invalid(key, e)),
        None => Ok(None),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>, ConfigError> {
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(invalid(key, format!("expected a boolean, got `{other}`"))),
        },
        None => Ok(None),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unparseable values are
    /// errors rather than silently defaulted.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        let has_db = database_url.is_some();

        let config = Self {
            sources_path: lookup("PERMITFLOW_SOURCES")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCES_PATH)),
            state_backend: parse_setting(&lookup, "PERMITFLOW_STATE_BACKEND")?.unwrap_or(
                if has_db {
                    StateBackend::Postgres
                } else {
                    StateBackend::File
                },
            ),
            state_file: lookup("PERMITFLOW_STATE_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
            sink_backend: parse_setting(&lookup, "PERMITFLOW_SINK_BACKEND")?.unwrap_or(
                if has_db {
                    SinkBackend::Postgres
                } else {
                    SinkBackend::Memory
                },
            ),
            chunk_size: parse_setting(&lookup, "PERMITFLOW_CHUNK_SIZE")?
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            isolate_failures: parse_flag(&lookup, "PERMITFLOW_ISOLATE_FAILURES")?.unwrap_or(true),
            max_concurrency: parse_setting(&lookup, "PERMITFLOW_MAX_CONCURRENCY")?,
            user_agent: lookup("PERMITFLOW_USER_AGENT")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| format!("permitflow/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: parse_setting(&lookup, "PERMITFLOW_HTTP_TIMEOUT_SECS")?.unwrap_or(30),
            max_retries: parse_setting(&lookup, "PERMITFLOW_MAX_RETRIES")?.unwrap_or(3),
            fallback_days: parse_setting(&lookup, "PERMITFLOW_FALLBACK_DAYS")?
                .unwrap_or(DEFAULT_FALLBACK_DAYS),
            max_pages: parse_setting(&lookup, "PERMITFLOW_MAX_PAGES")?
                .unwrap_or(permitflow_adapters::DEFAULT_MAX_PAGES),
            scheduler_enabled: parse_flag(&lookup, "PERMITFLOW_SCHEDULER_ENABLED")?.unwrap_or(false),
            sync_cron: lookup("PERMITFLOW_SYNC_CRON")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            bounds: parse_setting(&lookup, "PERMITFLOW_BBOX")?.unwrap_or_default(),
            database_url,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(invalid(
                "PERMITFLOW_CHUNK_SIZE",
                format!("must be between 1 and {MAX_CHUNK_SIZE}"),
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(invalid("PERMITFLOW_MAX_CONCURRENCY", "must be at least 1"));
        }
        if self.http_timeout_secs == 0 {
            return Err(invalid("PERMITFLOW_HTTP_TIMEOUT_SECS", "must be at least 1"));
        }
        if self.max_pages == 0 {
            return Err(invalid("PERMITFLOW_MAX_PAGES", "must be at least 1"));
        }
        if self.database_url.is_none()
            && (self.state_backend == StateBackend::Postgres
                || self.sink_backend == SinkBackend::Postgres)
        {
            return Err(invalid("DATABASE_URL", "required by the postgres backend"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Per-source rate limits and headers are layered on top of this.
    pub http: HttpClientConfig,
    pub chunk_size: usize,
    pub isolate_failures: bool,
    pub fallback_days: u32,
    pub max_concurrency: Option<usize>,
    pub max_pages: usize,
    pub bounds: GeoBounds,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            http: HttpClientConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            isolate_failures: true,
            fallback_days: DEFAULT_FALLBACK_DAYS,
            max_concurrency: None,
            max_pages: permitflow_adapters::DEFAULT_MAX_PAGES,
            bounds: GeoBounds::default(),
        }
    }
}

impl From<&SyncConfig> for PipelineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            http: HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                backoff: BackoffPolicy {
                    max_retries: config.max_retries,
                    ..BackoffPolicy::default()
                },
                ..HttpClientConfig::default()
            },
            chunk_size: config.chunk_size,
            isolate_failures: config.isolate_failures,
            fallback_days: config.fallback_days,
            max_concurrency: config.max_concurrency,
            max_pages: config.max_pages,
            bounds: config.bounds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRunStatus {
    Success,
    Failed,
    Cancelled,
    Skipped,
}

impl fmt::Display for SourceRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceRunStatus::Success => "success",
            SourceRunStatus::Failed => "failed",
            SourceRunStatus::Cancelled => "cancelled",
            SourceRunStatus::Skipped => "skipped",
        })
    }
}

#[derive(Debug, Error)]
pub enum SourceRunError {
    #[error(transparent)]
    State(#[from] WatermarkError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("{failed} record(s) failed delivery in {failed_chunks} chunk(s): {detail}")]
    Delivery {
        failed: usize,
        failed_chunks: usize,
        detail: String,
    },
    #[error("run cancelled")]
    Cancelled,
}

impl SourceRunError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            SourceRunError::Cancelled => true,
            SourceRunError::Adapter(err) => err.is_cancelled(),
            SourceRunError::Transport(err) => err.is_cancelled(),
            _ => false,
        }
    }
}

/// Outcome of one source within one run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub kind: SourceKind,
    pub run_id: Uuid,
    pub status: SourceRunStatus,
    pub since: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: usize,
    pub records_fetched: usize,
    pub parse_errors: usize,
    pub records_filtered: usize,
    pub records_normalized: usize,
    pub records_skipped: usize,
    pub normalization_issues: usize,
    pub records_delivered_success: usize,
    pub records_delivered_failed: usize,
    pub records_inserted: usize,
    pub records_updated: usize,
    pub records_unchanged: usize,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub error: Option<String>,
}

impl SourceRunReport {
    fn new(config: &SourceConfig, run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            source_id: config.id.clone(),
            kind: config.kind,
            run_id,
            status: SourceRunStatus::Failed,
            since: None,
            started_at,
            finished_at: started_at,
            pages_fetched: 0,
            records_fetched: 0,
            parse_errors: 0,
            records_filtered: 0,
            records_normalized: 0,
            records_skipped: 0,
            normalization_issues: 0,
            records_delivered_success: 0,
            records_delivered_failed: 0,
            records_inserted: 0,
            records_updated: 0,
            records_unchanged: 0,
            chunks: 0,
            failed_chunks: 0,
            error: None,
        }
    }

    fn finish(mut self, status: SourceRunStatus, error: Option<String>) -> Self {
        self.status = status;
        self.error = error;
        self.finished_at = Utc::now();
        self
    }

    fn apply_delivery(&mut self, delivery: &DeliveryReport) {
        self.records_delivered_success = delivery.success;
        self.records_delivered_failed = delivery.failed;
        self.records_inserted = delivery.inserted;
        self.records_updated = delivery.updated;
        self.records_unchanged = delivery.unchanged;
        self.chunks = delivery.chunks;
        self.failed_chunks = delivery.failed_chunks;
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            SourceRunStatus::Failed | SourceRunStatus::Cancelled
        )
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} {} fetched={} parse_errors={} normalized={} skipped={} issues={} delivered={} failed={} inserted={} updated={} unchanged={}",
            self.source_id,
            self.status,
            self.records_fetched,
            self.parse_errors,
            self.records_normalized,
            self.records_skipped,
            self.normalization_issues,
            self.records_delivered_success,
            self.records_delivered_failed,
            self.records_inserted,
            self.records_updated,
            self.records_unchanged,
        );
        if let Some(error) = &self.error {
            line.push_str(&format!(" error=\"{error}\""));
        }
        line
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRunReport>,
}

impl RunSummary {
    pub fn failed_count(&self) -> usize {
        self.sources.iter().filter(|s| s.is_failure()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count() > 0
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceRunReport> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

type LeaseSet = Arc<StdMutex<HashSet<String>>>;

/// Held for the duration of one source run; released on drop.
struct SourceLease {
    set: LeaseSet,
    source_id: String,
}

impl SourceLease {
    fn acquire(set: &LeaseSet, source_id: &str) -> Option<Self> {
        let mut held = set.lock().unwrap_or_else(PoisonError::into_inner);
        held.insert(source_id.to_string()).then(|| Self {
            set: Arc::clone(set),
            source_id: source_id.to_string(),
        })
    }
}

impl Drop for SourceLease {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.source_id);
    }
}

/// Drives every configured source through fetch, parse, normalize, deliver
/// and watermark advance.
#[derive(Clone)]
pub struct IngestPipeline {
    sources: Arc<Vec<SourceConfig>>,
    state: Arc<dyn WatermarkStore>,
    sink: Arc<dyn DeliverySink>,
    settings: PipelineSettings,
    leases: LeaseSet,
}

impl IngestPipeline {
    pub fn new(
        sources: Vec<SourceConfig>,
        state: Arc<dyn WatermarkStore>,
        sink: Arc<dyn DeliverySink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            sources: Arc::new(sources),
            state,
            sink,
            settings,
            leases: Arc::default(),
        }
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn state(&self) -> &Arc<dyn WatermarkStore> {
        &self.state
    }

    /// Runs every enabled source.
    pub async fn run_once(&self, cancel: &CancellationToken) -> RunSummary {
        let enabled = self.sources.iter().filter(|s| s.enabled).cloned().collect();
        self.run_sources(enabled, cancel).await
    }

    /// Runs one source by id, whether or not it is enabled.
    pub async fn run_source_by_id(
        &self,
        source_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let source = self
            .sources
            .iter()
            .find(|s| s.id == source_id)
            .cloned()
            .with_context(|| format!("no source configured with id `{source_id}`"))?;
        Ok(self.run_sources(vec![source], cancel).await)
    }

    async fn run_sources(&self, sources: Vec<SourceConfig>, cancel: &CancellationToken) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let limit = self
            .settings
            .max_concurrency
            .unwrap_or_else(|| sources.len().min(MAX_DEFAULT_CONCURRENCY))
            .max(1);
        info!(%run_id, sources = sources.len(), concurrency = limit, "sync run starting");

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut handles = Vec::with_capacity(sources.len());
        for config in sources {
            let pipeline = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let task_config = config.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                pipeline.execute(&task_config, run_id, &cancel).await
            });
            handles.push((config, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (config, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(err) => {
                    error!(source_id = %config.id, error = %err, "source task aborted");
                    SourceRunReport::new(&config, run_id, started_at)
                        .finish(SourceRunStatus::Failed, Some(format!("source task aborted: {err}")))
                }
            };
            reports.push(report);
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: reports,
        };
        info!(
            %run_id,
            sources = summary.sources.len(),
            failed = summary.failed_count(),
            "sync run finished"
        );
        summary
    }

    /// One source, outside any batch run.
    pub async fn run_source(&self, config: &SourceConfig, cancel: &CancellationToken) -> SourceRunReport {
        self.execute(config, Uuid::new_v4(), cancel).await
    }

    async fn execute(
        &self,
        config: &SourceConfig,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> SourceRunReport {
        let span = info_span!("source_run", source_id = %config.id, kind = %config.kind, %run_id);
        async move {
            let started_at = Utc::now();
            let mut report = SourceRunReport::new(config, run_id, started_at);

            let Some(_lease) = SourceLease::acquire(&self.leases, &config.id) else {
                warn!("source already running; skipped");
                return report.finish(SourceRunStatus::Skipped, Some("already running".to_string()));
            };
            if cancel.is_cancelled() {
                return report.finish(
                    SourceRunStatus::Cancelled,
                    Some("cancelled before start".to_string()),
                );
            }

            match self.ingest(config, run_id, started_at, cancel, &mut report).await {
                Ok(()) => {
                    info!(
                        fetched = report.records_fetched,
                        normalized = report.records_normalized,
                        delivered = report.records_delivered_success,
                        inserted = report.records_inserted,
                        updated = report.records_updated,
                        "source run succeeded"
                    );
                    report.finish(SourceRunStatus::Success, None)
                }
                Err(failure) => {
                    let message = failure.to_string();
                    if let Err(err) = self.state.record_failure(&config.id, &message).await {
                        error!(error = %err, "recording failure in etl state");
                    }
                    let status = if failure.is_cancelled() {
                        SourceRunStatus::Cancelled
                    } else {
                        SourceRunStatus::Failed
                    };
                    error!(error = %message, %status, "source run did not complete");
                    report.finish(status, Some(message))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn ingest(
        &self,
        config: &SourceConfig,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
        report: &mut SourceRunReport,
    ) -> Result<(), SourceRunError> {
        let fallback_days = config.fallback_days.unwrap_or(self.settings.fallback_days);
        let since = self
            .state
            .since_cursor(&config.id, fallback_days, started_at)
            .await?;
        report.since = Some(since);
        self.state.mark_running(&config.id).await?;
        info!(%since, "fetch window");

        let adapter = adapter_for_source(config, self.settings.bounds);
        let http = HttpFetcher::new(HttpClientConfig {
            rate_limit: Some(config.rate_limit),
            headers: adapter.request_headers(),
            ..self.settings.http.clone()
        })?
        .with_cancellation(cancel.clone());
        let ctx = AdapterContext {
            run_id,
            started_at,
            cancel: cancel.clone(),
            max_pages: self.settings.max_pages,
        };

        let pages = adapter.fetch(&http, &ctx, since).await?;
        report.pages_fetched = pages.len();

        let client_side = adapter.filters_client_side();
        let window_start = config.source_time(since);
        let date_field = config.date_field.as_deref();
        let mut records = Vec::new();
        for page in &pages {
            report.records_fetched += page.row_count;
            let parsed = adapter.parse(page);
            report.parse_errors += parsed.errors.len();
            for err in &parsed.errors {
                debug!(error = %err, "unparseable element");
            }
            for raw in parsed.records {
                if client_side && !within_window(&raw, date_field, window_start) {
                    report.records_filtered += 1;
                    continue;
                }
                match adapter.normalize(&raw, started_at) {
                    Ok(normalized) => {
                        report.normalization_issues += normalized.issues.len();
                        for issue in &normalized.issues {
                            debug!(
                                permit_id = %normalized.record.permit_id,
                                field = issue.field,
                                value = %issue.value,
                                reason = issue.reason,
                                "normalization issue"
                            );
                        }
                        records.push(normalized.record);
                    }
                    Err(err) => {
                        report.records_skipped += 1;
                        debug!(error = %err, "record skipped");
                    }
                }
            }
        }
        report.records_normalized = records.len();

        if cancel.is_cancelled() {
            return Err(SourceRunError::Cancelled);
        }

        let batch = UpsertBatch::new(records, config.conflict_key.clone())
            .with_chunk_size(self.settings.chunk_size)
            .with_isolation(self.settings.isolate_failures);
        let delivery = deliver(self.sink.as_ref(), batch).await;
        report.apply_delivery(&delivery);
        if delivery.failed > 0 {
            return Err(SourceRunError::Delivery {
                failed: delivery.failed,
                failed_chunks: delivery.failed_chunks,
                detail: delivery
                    .errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "no detail".to_string()),
            });
        }
        if cancel.is_cancelled() {
            return Err(SourceRunError::Cancelled);
        }

        self.state
            .advance(&config.id, started_at, delivery.success as u64)
            .await?;
        Ok(())
    }

    pub async fn maybe_build_scheduler(
        &self,
        enabled: bool,
        cron: &str,
        cancel: CancellationToken,
    ) -> Result<Option<JobScheduler>> {
        if !enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = self.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                let summary = pipeline.run_once(&cancel).await;
                info!(
                    run_id = %summary.run_id,
                    failed = summary.failed_count(),
                    "scheduled sync finished"
                );
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Watermark store and sink selected by configuration, plus the pool they
/// share when either is Postgres.
pub struct Backends {
    pub state: Arc<dyn WatermarkStore>,
    pub sink: Arc<dyn DeliverySink>,
    pool: Option<PgPool>,
}

async fn connect_pool(config: &SyncConfig) -> Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    let max_connections = config
        .max_concurrency
        .unwrap_or(MAX_DEFAULT_CONCURRENCY)
        .saturating_add(2) as u32;
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .context("connecting to DATABASE_URL")
}

fn state_store(config: &SyncConfig, pool: Option<&PgPool>) -> Result<Arc<dyn WatermarkStore>> {
    Ok(match config.state_backend {
        StateBackend::Postgres => Arc::new(PgWatermarkStore::new(
            pool.cloned().context("postgres state backend without a pool")?,
        )),
        StateBackend::File => Arc::new(FileWatermarkStore::new(config.state_file.clone())),
        StateBackend::Memory => Arc::new(MemoryWatermarkStore::new()),
    })
}

impl Backends {
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let needs_pool = config.state_backend == StateBackend::Postgres
            || config.sink_backend == SinkBackend::Postgres;
        let pool = if needs_pool {
            Some(connect_pool(config).await?)
        } else {
            None
        };

        let state = state_store(config, pool.as_ref())?;
        let sink: Arc<dyn DeliverySink> = match config.sink_backend {
            SinkBackend::Postgres => Arc::new(PgSink::new(
                pool.clone().context("postgres sink without a pool")?,
            )),
            SinkBackend::Memory => {
                warn!("memory sink selected; delivered permits are not persisted");
                Arc::new(MemorySink::new())
            }
        };
        Ok(Self { state, sink, pool })
    }

    /// Reads the configured watermarks but writes nothing: state is copied
    /// into memory and delivery goes to a memory sink.
    pub async fn dry_run(config: &SyncConfig) -> Result<Self> {
        let pool = if config.state_backend == StateBackend::Postgres {
            Some(connect_pool(config).await?)
        } else {
            None
        };
        let existing = state_store(config, pool.as_ref())?
            .list()
            .await
            .context("reading watermarks")?;
        Ok(Self {
            state: Arc::new(MemoryWatermarkStore::with_watermarks(existing)),
            sink: Arc::new(MemorySink::new()),
            pool,
        })
    }

    pub fn pipeline(&self, sources: Vec<SourceConfig>, settings: PipelineSettings) -> IngestPipeline {
        IngestPipeline::new(sources, Arc::clone(&self.state), Arc::clone(&self.sink), settings)
    }

    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }
}

/// One pass over `registry`, or over the single source `only`. A dry run
/// reads existing watermarks but writes neither permits nor watermarks.
pub async fn run_sync_once(
    config: &SyncConfig,
    registry: SourceRegistry,
    only: Option<&str>,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let backends = if dry_run {
        info!("dry run: permits and watermarks are not written");
        Backends::dry_run(config).await?
    } else {
        Backends::connect(config).await?
    };
    let pipeline = backends.pipeline(registry.sources, PipelineSettings::from(config));
    let summary = match only {
        Some(id) => pipeline.run_source_by_id(id, cancel).await,
        None => Ok(pipeline.run_once(cancel).await),
    };
    backends.close().await;
    summary
}
