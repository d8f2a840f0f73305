//! Static per-source configuration, loaded once at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::CANONICAL_COLUMNS;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("source `{source_id}`: {message}")]
    InvalidSource { source_id: String, message: String },
    #[error("duplicate source id `{0}`")]
    DuplicateSource(String),
    #[error("invalid conflict key column `{0}`")]
    InvalidConflictKey(String),
    #[error("invalid value for {key}: {message}")]
    InvalidSetting { key: String, message: String },
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn source(source_id: &str, message: impl Into<String>) -> Self {
        Self::InvalidSource {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Socrata,
    Arcgis,
    CsvHttp,
    Tpia,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Socrata => "socrata",
            SourceKind::Arcgis => "arcgis",
            SourceKind::CsvHttp => "csv_http",
            SourceKind::Tpia => "tpia",
        }
    }

    pub fn default_page_size(self) -> usize {
        match self {
            SourceKind::Socrata => 1000,
            SourceKind::Arcgis => 2000,
            SourceKind::CsvHttp => 5000,
            SourceKind::Tpia => 0,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socrata" => Ok(SourceKind::Socrata),
            "arcgis" => Ok(SourceKind::Arcgis),
            "csv_http" | "csv" => Ok(SourceKind::CsvHttp),
            "tpia" | "manual" => Ok(SourceKind::Tpia),
            other => Err(ConfigError::Message(format!("unknown source kind `{other}`"))),
        }
    }
}

/// Geographic window used to reject obviously wrong coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl Default for GeoBounds {
    /// Texas, with a little slack on every edge.
    fn default() -> Self {
        Self {
            min_lat: 25.8,
            min_lon: -106.7,
            max_lat: 36.6,
            max_lon: -93.5,
        }
    }
}

impl GeoBounds {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat.is_finite()
            && lon.is_finite()
            && lat >= self.min_lat
            && lat <= self.max_lat
            && lon >= self.min_lon
            && lon <= self.max_lon
    }
}

impl FromStr for GeoBounds {
    type Err = ConfigError;

    /// `min_lat,min_lon,max_lat,max_lon`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::InvalidSetting {
                key: "bounding box".to_string(),
                message: e.to_string(),
            })?;
        let [min_lat, min_lon, max_lat, max_lon] = parts.as_slice() else {
            return Err(ConfigError::InvalidSetting {
                key: "bounding box".to_string(),
                message: format!("expected 4 comma-separated numbers, got {}", parts.len()),
            });
        };
        if min_lat >= max_lat || min_lon >= max_lon {
            return Err(ConfigError::InvalidSetting {
                key: "bounding box".to_string(),
                message: "min must be below max".to_string(),
            });
        }
        Ok(Self {
            min_lat: *min_lat,
            min_lon: *min_lon,
            max_lat: *max_lat,
            max_lon: *max_lon,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CsvStrategy {
    /// Download the whole resource in one request.
    #[default]
    Full,
    /// Page with offset/limit query parameters.
    Offset,
    /// One request per leading character, A-Z then 0-9.
    Letters,
    /// One request per calendar day between the cursor and today.
    Days,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvOptions {
    #[serde(default)]
    pub strategy: CsvStrategy,
    #[serde(default = "default_offset_param")]
    pub offset_param: String,
    #[serde(default = "default_limit_param")]
    pub limit_param: String,
    #[serde(default = "default_partition_param")]
    pub partition_param: String,
    #[serde(default = "default_partition_date_format")]
    pub date_format: String,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            strategy: CsvStrategy::default(),
            offset_param: default_offset_param(),
            limit_param: default_limit_param(),
            partition_param: default_partition_param(),
            date_format: default_partition_date_format(),
        }
    }
}

fn default_offset_param() -> String {
    "offset".to_string()
}

fn default_limit_param() -> String {
    "limit".to_string()
}

fn default_partition_param() -> String {
    "partition".to_string()
}

fn default_partition_date_format() -> String {
    "%Y-%m-%d".to_string()
}

/// Destination columns whose values identify a permit row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ConflictKey(Vec<String>);

impl ConflictKey {
    pub fn new<I, S>(columns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(ConfigError::InvalidConflictKey(String::new()));
        }
        for column in &columns {
            if !CANONICAL_COLUMNS.contains(&column.as_str()) {
                return Err(ConfigError::InvalidConflictKey(column.clone()));
            }
        }
        Ok(Self(columns))
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }
}

impl Default for ConflictKey {
    fn default() -> Self {
        Self(vec!["source_id".to_string(), "permit_id".to_string()])
    }
}

impl TryFrom<Vec<String>> for ConflictKey {
    type Error = ConfigError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConflictKey> for Vec<String> {
    fn from(value: ConflictKey) -> Self {
        value.0
    }
}

impl fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

/// Immutable description of one permit feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: SourceKind,
    /// Dataset URL, layer URL, CSV URL, or drop directory for manual deliveries.
    pub endpoint: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    /// The source's "last changed" column, if it has one. Values without an
    /// offset are compared as UTC unless `utc_offset_minutes` is set.
    #[serde(default)]
    pub date_field: Option<String>,
    /// Wall-clock offset of `date_field`, e.g. `-360` for US Central. Use the
    /// standard-time offset; during DST the window overlaps by one extra hour.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
    #[serde(default)]
    pub conflict_key: ConflictKey,
    /// Source field name -> canonical field name.
    #[serde(default)]
    pub field_map: BTreeMap<String, String>,
    /// Requests per second.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: f64,
    #[serde(default)]
    pub page_size_hint: Option<usize>,
    #[serde(default)]
    pub fallback_days: Option<u32>,
    /// Extra server-side predicate ANDed into the incremental filter.
    #[serde(default)]
    pub where_clause: Option<String>,
    /// Name of the environment variable holding a Socrata app token.
    #[serde(default)]
    pub app_token_env: Option<String>,
    #[serde(default)]
    pub csv: CsvOptions,
    /// Public detail page, `{permit_id}` is substituted.
    #[serde(default)]
    pub url_template: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_rate_limit() -> f64 {
    1.0
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, kind: SourceKind, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            endpoint: endpoint.into(),
            enabled: true,
            jurisdiction: None,
            city: None,
            county: None,
            state: None,
            date_field: None,
            utc_offset_minutes: None,
            conflict_key: ConflictKey::default(),
            field_map: BTreeMap::new(),
            rate_limit: default_rate_limit(),
            page_size_hint: None,
            fallback_days: None,
            where_clause: None,
            app_token_env: None,
            csv: CsvOptions::default(),
            url_template: None,
        }
    }

    /// Jurisdiction label, falling back to the source id.
    pub fn jurisdiction_name(&self) -> &str {
        self.jurisdiction.as_deref().unwrap_or(&self.id)
    }

    /// The cursor as the source's wall clock would write it, for comparison
    /// against offset-less `date_field` values.
    pub fn source_time(&self, since: DateTime<Utc>) -> DateTime<Utc> {
        match self.utc_offset_minutes {
            Some(minutes) => since + TimeDelta::minutes(i64::from(minutes)),
            None => since,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size_hint
            .filter(|n| *n > 0)
            .unwrap_or_else(|| self.kind.default_page_size())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Message("source id must not be empty".to_string()));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::source(
                &self.id,
                "id may only contain ASCII letters, digits, '_' and '-'",
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::source(&self.id, "endpoint is required"));
        }
        if !(self.rate_limit.is_finite() && self.rate_limit > 0.0) {
            return Err(ConfigError::source(
                &self.id,
                format!("rate_limit must be > 0, got {}", self.rate_limit),
            ));
        }
        match self.kind {
            SourceKind::Socrata | SourceKind::Arcgis | SourceKind::CsvHttp => {
                if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
                    return Err(ConfigError::source(
                        &self.id,
                        format!("{} endpoint must be an http(s) URL", self.kind),
                    ));
                }
            }
            SourceKind::Tpia => {
                if self.jurisdiction.as_deref().map_or(true, |j| j.trim().is_empty()) {
                    return Err(ConfigError::source(
                        &self.id,
                        "tpia sources need a jurisdiction for the file naming convention",
                    ));
                }
            }
        }
        if self.kind == SourceKind::CsvHttp
            && self.csv.strategy == CsvStrategy::Days
            && self.date_field.is_none()
        {
            return Err(ConfigError::source(
                &self.id,
                "csv day partitioning requires date_field",
            ));
        }
        if let Some(minutes) = self.utc_offset_minutes {
            if minutes.abs() >= 24 * 60 {
                return Err(ConfigError::source(
                    &self.id,
                    format!("utc_offset_minutes must be within one day, got {minutes}"),
                ));
            }
        }
        for canonical in self.field_map.values() {
            if !CANONICAL_COLUMNS.contains(&canonical.as_str()) {
                return Err(ConfigError::source(
                    &self.id,
                    format!("field_map targets unknown canonical field `{canonical}`"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socrata() -> SourceConfig {
        SourceConfig::new(
            "dallas_permits",
            SourceKind::Socrata,
            "https://www.dallasopendata.com/resource/e7gq-4sah.json",
        )
    }

    #[test]
    fn yaml_defaults_fill_optional_fields() {
        let cfg: SourceConfig = serde_json::from_value(serde_json::json!({
            "id": "austin_permits",
            "kind": "socrata",
            "endpoint": "https://data.austintexas.gov/resource/3syk-w9eu.json",
            "date_field": "issue_date"
        }))
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.rate_limit, 1.0);
        assert_eq!(cfg.page_size(), 1000);
        assert_eq!(cfg.conflict_key, ConflictKey::default());
        assert_eq!(cfg.csv.strategy, CsvStrategy::Full);
        assert_eq!(cfg.jurisdiction_name(), "austin_permits");
    }

    #[test]
    fn conflict_key_rejects_unknown_columns() {
        assert!(ConflictKey::new(["source_id", "permit_id"]).is_ok());
        assert_eq!(
            ConflictKey::new(["source_id", "permit_id; DROP TABLE permits"]),
            Err(ConfigError::InvalidConflictKey(
                "permit_id; DROP TABLE permits".to_string()
            ))
        );
        let parsed: Result<SourceConfig, _> = serde_json::from_value(serde_json::json!({
            "id": "x", "kind": "socrata", "endpoint": "https://x", "conflict_key": ["nope"]
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn validation_fails_fast_on_bad_sources() {
        assert!(socrata().validate().is_ok());

        let mut bad_rate = socrata();
        bad_rate.rate_limit = 0.0;
        assert!(bad_rate.validate().is_err());

        let mut no_endpoint = socrata();
        no_endpoint.endpoint = " ".to_string();
        assert!(no_endpoint.validate().is_err());

        let tpia = SourceConfig::new("travis_tpia", SourceKind::Tpia, "./tpia");
        assert!(tpia.validate().is_err());

        let mut bad_map = socrata();
        bad_map
            .field_map
            .insert("permit_num".to_string(), "permit_number".to_string());
        assert!(bad_map.validate().is_err());
    }

    #[test]
    fn cursor_shifts_to_source_wall_clock() {
        let since = DateTime::parse_from_rfc3339("2025-01-15T16:29:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut cfg = socrata();
        assert_eq!(cfg.source_time(since), since);

        cfg.utc_offset_minutes = Some(-360);
        assert_eq!(
            cfg.source_time(since).to_rfc3339(),
            "2025-01-15T10:29:00+00:00"
        );
        assert!(cfg.validate().is_ok());

        cfg.utc_offset_minutes = Some(1440);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bounds_parse_and_contain() {
        let bounds: GeoBounds = "32.6,-97.0,33.0,-96.5".parse().unwrap();
        assert!(bounds.contains(32.78, -96.8));
        assert!(!bounds.contains(40.7, -74.0));
        assert!("1,2,3".parse::<GeoBounds>().is_err());
        assert!(GeoBounds::default().contains(30.27, -97.74));
    }
}
