//! Raw and canonical permit records, and the content fingerprint.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

/// Every column of the destination table, in insert order.
pub const CANONICAL_COLUMNS: &[&str] = &[
    "source_id",
    "permit_id",
    "jurisdiction",
    "city",
    "county",
    "state",
    "status",
    "permit_type",
    "description",
    "address",
    "postal_code",
    "valuation",
    "applied_at",
    "issued_at",
    "finaled_at",
    "latitude",
    "longitude",
    "contractor_name",
    "contractor_license",
    "url",
    "record_hash",
    "updated_at",
];

/// Columns excluded from the fingerprint.
pub const METADATA_COLUMNS: &[&str] = &["record_hash", "updated_at"];

/// Field-name -> value mapping exactly as a source returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fields: Map<String, JsonValue>,
    #[serde(rename = "_source")]
    pub source: String,
    #[serde(rename = "_jurisdiction")]
    pub jurisdiction: String,
    #[serde(rename = "_ingested_at")]
    pub ingested_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(
        fields: Map<String, JsonValue>,
        source: impl Into<String>,
        jurisdiction: impl Into<String>,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            fields,
            source: source.into(),
            jurisdiction: jurisdiction.into(),
            ingested_at,
        }
    }

    /// Exact lookup first, then a case-insensitive scan.
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name).or_else(|| {
            self.fields
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PermitStatus {
    Active,
    Closed,
    Pending,
    Cancelled,
    /// Unmapped source value, uppercased.
    Other(String),
}

impl PermitStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PermitStatus::Active => "ACTIVE",
            PermitStatus::Closed => "CLOSED",
            PermitStatus::Pending => "PENDING",
            PermitStatus::Cancelled => "CANCELLED",
            PermitStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for PermitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for PermitStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ACTIVE" => PermitStatus::Active,
            "CLOSED" => PermitStatus::Closed,
            "PENDING" => PermitStatus::Pending,
            "CANCELLED" => PermitStatus::Cancelled,
            _ => PermitStatus::Other(value.to_uppercase()),
        }
    }
}

impl From<PermitStatus> for String {
    fn from(value: PermitStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Canonical permit, the row shape delivered downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source_id: String,
    pub permit_id: String,
    pub jurisdiction: String,
    pub city: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub status: PermitStatus,
    pub permit_type: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub valuation: Option<f64>,
    pub applied_at: Option<DateTime<Utc>>,
    pub issued_at: Option<DateTime<Utc>>,
    pub finaled_at: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub contractor_name: Option<String>,
    pub contractor_license: Option<String>,
    pub url: Option<String>,
    pub record_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl NormalizedRecord {
    /// Recompute and store `record_hash`.
    pub fn seal(mut self) -> Self {
        self.record_hash = record_hash(&self);
        self
    }

    /// Text form of a key column, used for conflict-key matching.
    pub fn column_text(&self, column: &str) -> Option<String> {
        match column {
            "source_id" => Some(self.source_id.clone()),
            "permit_id" => Some(self.permit_id.clone()),
            "jurisdiction" => Some(self.jurisdiction.clone()),
            "status" => Some(self.status.as_str().to_string()),
            "record_hash" => Some(self.record_hash.clone()),
            "updated_at" => Some(format_ts(self.updated_at)),
            other => match substantive_fields(self).remove(other)? {
                JsonValue::Null => None,
                JsonValue::String(s) => Some(s),
                v => Some(v.to_string()),
            },
        }
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn opt_text(value: &Option<String>) -> JsonValue {
    value
        .as_ref()
        .map_or(JsonValue::Null, |s| JsonValue::String(s.clone()))
}

fn opt_ts(value: Option<DateTime<Utc>>) -> JsonValue {
    value.map_or(JsonValue::Null, |ts| JsonValue::String(format_ts(ts)))
}

fn opt_fixed(value: Option<f64>, decimals: usize) -> JsonValue {
    value.map_or(JsonValue::Null, |v| {
        JsonValue::String(format!("{v:.decimals$}"))
    })
}

/// One fingerprinted column with fixed formatting for numbers and timestamps.
fn hash_value(record: &NormalizedRecord, column: &str) -> JsonValue {
    match column {
        "source_id" => JsonValue::String(record.source_id.clone()),
        "permit_id" => JsonValue::String(record.permit_id.clone()),
        "jurisdiction" => JsonValue::String(record.jurisdiction.clone()),
        "city" => opt_text(&record.city),
        "county" => opt_text(&record.county),
        "state" => opt_text(&record.state),
        "status" => JsonValue::String(record.status.as_str().to_string()),
        "permit_type" => opt_text(&record.permit_type),
        "description" => opt_text(&record.description),
        "address" => opt_text(&record.address),
        "postal_code" => opt_text(&record.postal_code),
        "valuation" => opt_fixed(record.valuation, 2),
        "applied_at" => opt_ts(record.applied_at),
        "issued_at" => opt_ts(record.issued_at),
        "finaled_at" => opt_ts(record.finaled_at),
        "latitude" => opt_fixed(record.latitude, 6),
        "longitude" => opt_fixed(record.longitude, 6),
        "contractor_name" => opt_text(&record.contractor_name),
        "contractor_license" => opt_text(&record.contractor_license),
        "url" => opt_text(&record.url),
        _ => JsonValue::Null,
    }
}

/// Every canonical column except [`METADATA_COLUMNS`].
fn substantive_fields(record: &NormalizedRecord) -> BTreeMap<&'static str, JsonValue> {
    CANONICAL_COLUMNS
        .iter()
        .copied()
        .filter(|column| !METADATA_COLUMNS.contains(column))
        .map(|column| (column, hash_value(record, column)))
        .collect()
}

/// SHA-256 hex over the sorted-key JSON of all non-metadata fields.
pub fn record_hash(record: &NormalizedRecord) -> String {
    let fields = substantive_fields(record);
    let mut canonical = String::from("{");
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            canonical.push(',');
        }
        canonical.push_str(&JsonValue::String((*key).to_string()).to_string());
        canonical.push(':');
        canonical.push_str(&value.to_string());
    }
    canonical.push('}');
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Unknown,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Unknown => "UNKNOWN",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => RunStatus::Running,
            "SUCCESS" => RunStatus::Success,
            "FAILED" => RunStatus::Failed,
            _ => RunStatus::Unknown,
        })
    }
}

/// Persisted per-source ETL state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub source_id: String,
    pub last_run: DateTime<Utc>,
    pub last_status: RunStatus,
    pub records_processed: u64,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> NormalizedRecord {
        NormalizedRecord {
            source_id: "dallas_permits".into(),
            permit_id: "BP-2025-0001".into(),
            jurisdiction: "Dallas".into(),
            city: Some("Dallas".into()),
            county: Some("Dallas".into()),
            state: Some("TX".into()),
            status: PermitStatus::Active,
            permit_type: Some("NEW_CONSTRUCTION".into()),
            description: Some("New single family residence".into()),
            address: Some("1500 Marilla St".into()),
            postal_code: Some("75201".into()),
            valuation: Some(350_000.0),
            applied_at: Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).single(),
            issued_at: Utc.with_ymd_and_hms(2025, 1, 10, 15, 30, 0).single(),
            finaled_at: None,
            latitude: Some(32.7767),
            longitude: Some(-96.797),
            contractor_name: Some("Acme Builders".into()),
            contractor_license: None,
            url: None,
            record_hash: String::new(),
            updated_at: Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).single().unwrap(),
        }
        .seal()
    }

    #[test]
    fn hash_is_stable_and_hex() {
        let a = sample();
        let b = sample();
        assert_eq!(a.record_hash, b.record_hash);
        assert_eq!(a.record_hash.len(), 64);
        assert!(a.record_hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_ignores_metadata_fields() {
        let a = sample();
        let mut b = a.clone();
        b.updated_at = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).single().unwrap();
        assert_eq!(record_hash(&a), record_hash(&b));
    }

    #[test]
    fn fingerprint_covers_every_non_metadata_column() {
        let fields = substantive_fields(&sample());
        assert_eq!(fields.len(), CANONICAL_COLUMNS.len() - METADATA_COLUMNS.len());
        assert!(METADATA_COLUMNS.iter().all(|c| !fields.contains_key(c)));
        assert_eq!(fields["valuation"], JsonValue::String("350000.00".into()));
        assert_eq!(fields["latitude"], JsonValue::String("32.776700".into()));
        assert!(fields.values().filter(|v| v.is_null()).count() >= 3);
    }

    #[test]
    fn hash_changes_with_any_substantive_field() {
        let base = sample();
        let mutations: Vec<Box<dyn Fn(&mut NormalizedRecord)>> = vec![
            Box::new(|r: &mut NormalizedRecord| r.status = PermitStatus::Closed),
            Box::new(|r: &mut NormalizedRecord| r.valuation = Some(350_000.01)),
            Box::new(|r: &mut NormalizedRecord| r.description = None),
            Box::new(|r: &mut NormalizedRecord| r.latitude = Some(32.7768)),
            Box::new(|r: &mut NormalizedRecord| r.finaled_at = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single()),
            Box::new(|r: &mut NormalizedRecord| r.contractor_license = Some("TX-123".into())),
            Box::new(|r: &mut NormalizedRecord| r.permit_id = "BP-2025-0002".into()),
        ];
        for mutate in mutations {
            let mut changed = base.clone();
            mutate(&mut changed);
            assert_ne!(record_hash(&changed), base.record_hash);
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        let json = serde_json::to_string(&PermitStatus::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
        let other: PermitStatus = serde_json::from_str("\"under appeal\"").unwrap();
        assert_eq!(other, PermitStatus::Other("UNDER APPEAL".into()));
    }

    #[test]
    fn column_text_covers_key_columns() {
        let r = sample();
        assert_eq!(r.column_text("permit_id").as_deref(), Some("BP-2025-0001"));
        assert_eq!(r.column_text("postal_code").as_deref(), Some("75201"));
        assert_eq!(r.column_text("finaled_at"), None);
    }

    #[test]
    fn raw_lookup_is_case_insensitive() {
        let mut fields = Map::new();
        fields.insert("PERMIT_NUMBER".into(), JsonValue::String("A1".into()));
        let raw = RawRecord::new(fields, "s", "j", Utc::now());
        assert_eq!(raw.get("permit_number"), Some(&JsonValue::String("A1".into())));
        assert!(raw.get("missing").is_none());
    }
}
