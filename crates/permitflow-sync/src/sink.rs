//! Chunked idempotent upsert of normalized permits.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use permitflow_core::{ConflictKey, NormalizedRecord, CANONICAL_COLUMNS};
use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Bind parameters per row in the permits insert.
pub const PARAMS_PER_ROW: usize = 22;

/// Postgres caps a statement at 65535 bind parameters.
pub const MAX_CHUNK_SIZE: usize = 65_535 / PARAMS_PER_ROW;

const MAX_REPORTED_ERRORS: usize = 20;

pub const PERMITS_TABLE: &str = "permits";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("permits upsert failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record rejected: {0}")]
    Rejected(String),
}

/// One delivery call: the records of a run plus how to key and split them.
#[derive(Debug, Clone)]
pub struct UpsertBatch {
    pub records: Vec<NormalizedRecord>,
    pub conflict_key: ConflictKey,
    pub chunk_size: usize,
    /// Re-send a failed chunk one record at a time to find the bad rows.
    pub isolate_failures: bool,
}

impl UpsertBatch {
    pub fn new(records: Vec<NormalizedRecord>, conflict_key: ConflictKey) -> Self {
        Self {
            records,
            conflict_key,
            chunk_size: DEFAULT_CHUNK_SIZE,
            isolate_failures: true,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_isolation(mut self, isolate_failures: bool) -> Self {
        self.isolate_failures = isolate_failures;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub success: usize,
    pub failed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Earlier rows superseded by a later row with the same key in one chunk.
    pub duplicates: usize,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub errors: Vec<String>,
}

impl DeliveryReport {
    fn absorb(&mut self, outcome: ChunkOutcome) {
        self.inserted += outcome.inserted;
        self.updated += outcome.updated;
        self.unchanged += outcome.unchanged;
    }

    fn note_error(&mut self, message: String) {
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(message);
        }
    }
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Upserts one chunk atomically. Keys within `records` are unique.
    async fn upsert_chunk(
        &self,
        records: &[NormalizedRecord],
        key: &ConflictKey,
    ) -> Result<ChunkOutcome, DeliveryError>;
}

fn key_of(record: &NormalizedRecord, key: &ConflictKey) -> Vec<Option<String>> {
    key.columns()
        .iter()
        .map(|column| record.column_text(column))
        .collect()
}

/// Keeps the last occurrence of each key, in first-seen order.
fn collapse_duplicates(chunk: &[NormalizedRecord], key: &ConflictKey) -> Vec<NormalizedRecord> {
    let mut slots: BTreeMap<Vec<Option<String>>, usize> = BTreeMap::new();
    let mut out: Vec<NormalizedRecord> = Vec::with_capacity(chunk.len());
    for record in chunk {
        let k = key_of(record, key);
        match slots.get(&k) {
            Some(&idx) => out[idx] = record.clone(),
            None => {
                slots.insert(k, out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

/// Splits the batch into chunks and upserts each one. A failed chunk is
/// counted and delivery continues with the next.
pub async fn deliver(sink: &dyn DeliverySink, batch: UpsertBatch) -> DeliveryReport {
    let chunk_size = batch.chunk_size.clamp(1, MAX_CHUNK_SIZE);
    let mut report = DeliveryReport::default();

    for (index, chunk) in batch.records.chunks(chunk_size).enumerate() {
        report.chunks += 1;
        let rows = collapse_duplicates(chunk, &batch.conflict_key);
        report.duplicates += chunk.len() - rows.len();

        match sink.upsert_chunk(&rows, &batch.conflict_key).await {
            Ok(outcome) => {
                debug!(chunk = index, rows = rows.len(), ?outcome, "chunk delivered");
                report.success += rows.len();
                report.absorb(outcome);
            }
            Err(err) => {
                report.failed_chunks += 1;
                warn!(chunk = index, rows = rows.len(), error = %err, "chunk failed");
                if !batch.isolate_failures {
                    report.failed += rows.len();
                    report.note_error(format!("chunk {index}: {err}"));
                    continue;
                }
                for record in &rows {
                    match sink
                        .upsert_chunk(std::slice::from_ref(record), &batch.conflict_key)
                        .await
                    {
                        Ok(outcome) => {
                            report.success += 1;
                            report.absorb(outcome);
                        }
                        Err(err) => {
                            report.failed += 1;
                            report.note_error(format!("permit {}: {err}", record.permit_id));
                        }
                    }
                }
            }
        }
    }
    report
}

type Rejector = Arc<dyn Fn(&NormalizedRecord) -> bool + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<Vec<Option<String>>, NormalizedRecord>,
    chunk_sizes: Vec<usize>,
}

/// In-process destination with the same insert/update/unchanged semantics
/// as the permits table.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
    reject: Option<Rejector>,
}

impl std::fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySink")
            .field("rejects", &self.reject.is_some())
            .finish_non_exhaustive()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any chunk containing a record matching `predicate` fails as a whole.
    pub fn rejecting(predicate: impl Fn(&NormalizedRecord) -> bool + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::default(),
            reject: Some(Arc::new(predicate)),
        }
    }

    pub async fn records(&self) -> Vec<NormalizedRecord> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Size of every chunk received, failed ones included.
    pub async fn chunk_sizes(&self) -> Vec<usize> {
        self.state.lock().await.chunk_sizes.clone()
    }
}

#[async_trait]
impl DeliverySink for MemorySink {
    async fn upsert_chunk(
        &self,
        records: &[NormalizedRecord],
        key: &ConflictKey,
    ) -> Result<ChunkOutcome, DeliveryError> {
        let mut state = self.state.lock().await;
        state.chunk_sizes.push(records.len());
        if let Some(reject) = &self.reject {
            if let Some(bad) = records.iter().find(|&r| reject(r)) {
                return Err(DeliveryError::Rejected(bad.permit_id.clone()));
            }
        }

        let mut outcome = ChunkOutcome::default();
        for record in records {
            match state.rows.entry(key_of(record, key)) {
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                    outcome.inserted += 1;
                }
                Entry::Occupied(mut slot) if slot.get().record_hash != record.record_hash => {
                    slot.insert(record.clone());
                    outcome.updated += 1;
                }
                Entry::Occupied(_) => outcome.unchanged += 1,
            }
        }
        Ok(outcome)
    }
}

/// `permits` table. Requires a unique index over the conflict key columns.
#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_upsert_tail(qb: &mut QueryBuilder<'_, Postgres>, key: &ConflictKey) {
    let key_columns = key.columns();
    let assignments = CANONICAL_COLUMNS
        .iter()
        .filter(|column| !key_columns.iter().any(|k| k == *column))
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    qb.push(" ON CONFLICT (")
        .push(key_columns.join(", "))
        .push(") DO UPDATE SET ")
        .push(assignments)
        .push(format!(
            " WHERE {PERMITS_TABLE}.record_hash IS DISTINCT FROM EXCLUDED.record_hash"
        ))
        .push(" RETURNING (xmax = 0) AS inserted");
}

#[async_trait]
impl DeliverySink for PgSink {
    async fn upsert_chunk(
        &self,
        records: &[NormalizedRecord],
        key: &ConflictKey,
    ) -> Result<ChunkOutcome, DeliveryError> {
        if records.is_empty() {
            return Ok(ChunkOutcome::default());
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {PERMITS_TABLE} ({}) ",
            CANONICAL_COLUMNS.join(", ")
        ));
        qb.push_values(records, |mut row, r| {
            row.push_bind(r.source_id.clone())
                .push_bind(r.permit_id.clone())
                .push_bind(r.jurisdiction.clone())
                .push_bind(r.city.clone())
                .push_bind(r.county.clone())
                .push_bind(r.state.clone())
                .push_bind(r.status.as_str().to_string())
                .push_bind(r.permit_type.clone())
                .push_bind(r.description.clone())
                .push_bind(r.address.clone())
                .push_bind(r.postal_code.clone())
                .push_bind(r.valuation)
                .push_bind(r.applied_at)
                .push_bind(r.issued_at)
                .push_bind(r.finaled_at)
                .push_bind(r.latitude)
                .push_bind(r.longitude)
                .push_bind(r.contractor_name.clone())
                .push_bind(r.contractor_license.clone())
                .push_bind(r.url.clone())
                .push_bind(r.record_hash.clone())
                .push_bind(r.updated_at);
        });
        push_upsert_tail(&mut qb, key);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut inserted = 0usize;
        for row in &rows {
            if row.try_get::<bool, _>("inserted")? {
                inserted += 1;
            }
        }
        Ok(ChunkOutcome {
            inserted,
            updated: rows.len() - inserted,
            unchanged: records.len() - rows.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use permitflow_core::PermitStatus;

    fn record(permit_id: &str, description: &str) -> NormalizedRecord {
        NormalizedRecord {
            source_id: "dallas_permits".into(),
            permit_id: permit_id.into(),
            jurisdiction: "Dallas".into(),
            city: Some("Dallas".into()),
            county: None,
            state: Some("TX".into()),
            status: PermitStatus::Active,
            permit_type: None,
            description: Some(description.into()),
            address: None,
            postal_code: None,
            valuation: None,
            applied_at: None,
            issued_at: None,
            finaled_at: None,
            latitude: None,
            longitude: None,
            contractor_name: None,
            contractor_license: None,
            url: None,
            record_hash: String::new(),
            updated_at: Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap(),
        }
        .seal()
    }

    fn batch(records: Vec<NormalizedRecord>) -> UpsertBatch {
        UpsertBatch::new(records, ConflictKey::default())
    }

    #[tokio::test]
    async fn second_delivery_is_a_no_op() {
        let sink = MemorySink::new();
        let records: Vec<_> = (0..3).map(|i| record(&format!("BP-{i}"), "deck")).collect();

        let first = deliver(&sink, batch(records.clone())).await;
        assert_eq!((first.inserted, first.updated, first.success), (3, 0, 3));

        let second = deliver(&sink, batch(records)).await;
        assert_eq!((second.inserted, second.updated, second.unchanged), (0, 0, 3));
        assert_eq!(sink.len().await, 3);
    }

    #[tokio::test]
    async fn changed_hash_updates_in_place() {
        let sink = MemorySink::new();
        deliver(&sink, batch(vec![record("BP-1", "deck")])).await;
        let report = deliver(&sink, batch(vec![record("BP-1", "deck and pergola")])).await;
        assert_eq!(report.updated, 1);
        let stored = sink.records().await;
        assert_eq!(stored[0].description.as_deref(), Some("deck and pergola"));
    }

    #[tokio::test]
    async fn chunks_follow_chunk_size() {
        let sink = MemorySink::new();
        let records: Vec<_> = (0..1250).map(|i| record(&format!("BP-{i}"), "x")).collect();
        let report = deliver(&sink, batch(records)).await;
        assert_eq!(sink.chunk_sizes().await, vec![500, 500, 250]);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.success, 1250);
    }

    #[tokio::test]
    async fn duplicate_keys_in_a_chunk_keep_the_last_row() {
        let sink = MemorySink::new();
        let report = deliver(
            &sink,
            batch(vec![record("BP-1", "first"), record("BP-2", "x"), record("BP-1", "second")]),
        )
        .await;
        assert_eq!(report.duplicates, 1);
        assert_eq!(sink.chunk_sizes().await, vec![2]);
        let stored = sink.records().await;
        assert_eq!(stored[0].description.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn failed_chunk_is_isolated_record_by_record() {
        let sink = MemorySink::rejecting(|r| r.permit_id == "BP-3");
        let records: Vec<_> = (0..6).map(|i| record(&format!("BP-{i}"), "x")).collect();
        let report = deliver(&sink, batch(records).with_chunk_size(4)).await;

        assert_eq!(report.failed_chunks, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.success, 5);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("BP-3"));
        assert_eq!(sink.len().await, 5);
    }

    #[tokio::test]
    async fn failed_chunk_without_isolation_fails_every_row() {
        let sink = MemorySink::rejecting(|r| r.permit_id == "BP-0");
        let records: Vec<_> = (0..6).map(|i| record(&format!("BP-{i}"), "x")).collect();
        let report = deliver(&sink, batch(records).with_chunk_size(4).with_isolation(false)).await;
        assert_eq!((report.failed, report.success, report.failed_chunks), (4, 2, 1));
    }

    #[test]
    fn upsert_sql_updates_only_changed_rows() {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("INSERT INTO permits (...) VALUES (...)");
        push_upsert_tail(&mut qb, &ConflictKey::default());
        let sql = qb.sql().to_string();
        assert!(sql.contains("ON CONFLICT (source_id, permit_id) DO UPDATE SET jurisdiction = EXCLUDED.jurisdiction"));
        assert!(!sql.contains("permit_id = EXCLUDED.permit_id"));
        assert!(sql.contains("WHERE permits.record_hash IS DISTINCT FROM EXCLUDED.record_hash"));
        assert!(sql.ends_with("RETURNING (xmax = 0) AS inserted"));
    }
}
