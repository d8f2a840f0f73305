//! Per-source ETL state: when each source last completed successfully.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use permitflow_core::{RunStatus, Watermark};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Overlap between consecutive windows so rows stamped while the previous
/// run was finishing are fetched again.
pub const GAP_BUFFER_SECS: i64 = 60;

pub fn gap_buffer() -> TimeDelta {
    TimeDelta::seconds(GAP_BUFFER_SECS)
}

/// Start of the next fetch window.
pub fn cursor_from(
    last_run: Option<DateTime<Utc>>,
    fallback_days: u32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match last_run {
        Some(last_run) => last_run - gap_buffer(),
        None => now - TimeDelta::days(i64::from(fallback_days)),
    }
}

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("etl_state query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("watermark file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("watermark file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, source_id: &str) -> Result<Option<Watermark>, WatermarkError>;

    async fn since_cursor(
        &self,
        source_id: &str,
        fallback_days: u32,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, WatermarkError> {
        let last_run = self.get(source_id).await?.map(|w| w.last_run);
        Ok(cursor_from(last_run, fallback_days, now))
    }

    /// Flags an existing row as RUNNING; never creates one.
    async fn mark_running(&self, source_id: &str) -> Result<(), WatermarkError>;

    /// Moves `last_run` forward to `ts` (never backward) and records success.
    async fn advance(
        &self,
        source_id: &str,
        ts: DateTime<Utc>,
        records_processed: u64,
    ) -> Result<(), WatermarkError>;

    /// Marks an existing row FAILED, leaving `last_run` untouched.
    async fn record_failure(&self, source_id: &str, message: &str) -> Result<(), WatermarkError>;

    async fn list(&self) -> Result<Vec<Watermark>, WatermarkError>;
}

type StateMap = BTreeMap<String, Watermark>;

fn apply_running(state: &mut StateMap, source_id: &str) {
    if let Some(row) = state.get_mut(source_id) {
        row.last_status = RunStatus::Running;
        row.error_message = None;
    }
}

fn apply_advance(state: &mut StateMap, source_id: &str, ts: DateTime<Utc>, records: u64) {
    let row = state
        .entry(source_id.to_string())
        .or_insert_with(|| Watermark {
            source_id: source_id.to_string(),
            last_run: ts,
            last_status: RunStatus::Unknown,
            records_processed: 0,
            error_message: None,
        });
    row.last_run = row.last_run.max(ts);
    row.last_status = RunStatus::Success;
    row.records_processed = records;
    row.error_message = None;
}

fn apply_failure(state: &mut StateMap, source_id: &str, message: &str) {
    if let Some(row) = state.get_mut(source_id) {
        row.last_status = RunStatus::Failed;
        row.error_message = Some(message.to_string());
    }
}

#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    state: Mutex<StateMap>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watermarks(rows: impl IntoIterator<Item = Watermark>) -> Self {
        let state = rows
            .into_iter()
            .map(|w| (w.source_id.clone(), w))
            .collect();
        Self {
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, source_id: &str) -> Result<Option<Watermark>, WatermarkError> {
        Ok(self.state.lock().await.get(source_id).cloned())
    }

    async fn mark_running(&self, source_id: &str) -> Result<(), WatermarkError> {
        apply_running(&mut *self.state.lock().await, source_id);
        Ok(())
    }

    async fn advance(
        &self,
        source_id: &str,
        ts: DateTime<Utc>,
        records_processed: u64,
    ) -> Result<(), WatermarkError> {
        apply_advance(&mut *self.state.lock().await, source_id, ts, records_processed);
        Ok(())
    }

    async fn record_failure(&self, source_id: &str, message: &str) -> Result<(), WatermarkError> {
        apply_failure(&mut *self.state.lock().await, source_id, message);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Watermark>, WatermarkError> {
        Ok(self.state.lock().await.values().cloned().collect())
    }
}

/// JSON document keyed by source id, rewritten atomically on every change.
#[derive(Debug)]
pub struct FileWatermarkStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> WatermarkError {
        WatermarkError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn load(&self) -> Result<StateMap, WatermarkError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| WatermarkError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StateMap::new()),
            Err(err) => Err(self.io_error(err)),
        }
    }

    async fn save(&self, state: &StateMap) -> Result<(), WatermarkError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| self.io_error(e))?;

        let bytes = serde_json::to_vec_pretty(state).map_err(|source| WatermarkError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let temp_path = parent.join(format!(".{}.watermarks.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&bytes).await.map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(err));
        }
        Ok(())
    }

    async fn update(&self, apply: impl FnOnce(&mut StateMap)) -> Result<(), WatermarkError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await?;
        apply(&mut state);
        self.save(&state).await
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn get(&self, source_id: &str) -> Result<Option<Watermark>, WatermarkError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(source_id))
    }

    async fn mark_running(&self, source_id: &str) -> Result<(), WatermarkError> {
        self.update(|state| apply_running(state, source_id)).await
    }

    async fn advance(
        &self,
        source_id: &str,
        ts: DateTime<Utc>,
        records_processed: u64,
    ) -> Result<(), WatermarkError> {
        self.update(|state| apply_advance(state, source_id, ts, records_processed))
            .await
    }

    async fn record_failure(&self, source_id: &str, message: &str) -> Result<(), WatermarkError> {
        self.update(|state| apply_failure(state, source_id, message))
            .await
    }

    async fn list(&self) -> Result<Vec<Watermark>, WatermarkError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_values().collect())
    }
}

/// `etl_state` table.
#[derive(Debug, Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Watermark, sqlx::Error> {
        let status: Option<String> = row.try_get("last_status")?;
        let records: Option<i64> = row.try_get("records_processed")?;
        Ok(Watermark {
            source_id: row.try_get("source_id")?,
            last_run: row.try_get("last_run")?,
            last_status: status
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            records_processed: records.map_or(0, |n| u64::try_from(n).unwrap_or(0)),
            error_message: row.try_get("error_message")?,
        })
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn get(&self, source_id: &str) -> Result<Option<Watermark>, WatermarkError> {
        let row = sqlx::query(
            r#"
            SELECT source_id, last_run, last_status, records_processed, error_message
              FROM etl_state
             WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::from_row).transpose()?)
    }

    async fn mark_running(&self, source_id: &str) -> Result<(), WatermarkError> {
        sqlx::query(
            r#"
            UPDATE etl_state
               SET last_status = 'RUNNING',
                   error_message = NULL
             WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn advance(
        &self,
        source_id: &str,
        ts: DateTime<Utc>,
        records_processed: u64,
    ) -> Result<(), WatermarkError> {
        sqlx::query(
            r#"
            INSERT INTO etl_state (source_id, last_run, last_status, records_processed, error_message)
            VALUES ($1, $2, 'SUCCESS', $3, NULL)
            ON CONFLICT (source_id) DO UPDATE
              SET last_run = GREATEST(etl_state.last_run, EXCLUDED.last_run),
                  last_status = 'SUCCESS',
                  records_processed = EXCLUDED.records_processed,
                  error_message = NULL
            "#,
        )
        .bind(source_id)
        .bind(ts)
        .bind(i64::try_from(records_processed).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, source_id: &str, message: &str) -> Result<(), WatermarkError> {
        sqlx::query(
            r#"
            UPDATE etl_state
               SET last_status = 'FAILED',
                   error_message = $2
             WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Watermark>, WatermarkError> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, last_run, last_status, records_processed, error_message
              FROM etl_state
             ORDER BY source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(Self::from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}
