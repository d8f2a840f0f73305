//! Source adapter contracts and one implementation per upstream kind.

mod arcgis;
mod csv_http;
pub mod normalize;
mod socrata;
mod tpia;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use permitflow_core::{GeoBounds, RawRecord, SourceConfig, SourceKind};
use permitflow_transport::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use arcgis::{clamp_page_size, ArcgisAdapter};
pub use csv_http::{day_partitions, letter_partitions, CsvHttpAdapter};
pub use normalize::{
    parse_timestamp, parse_timestamp_value, FieldIssue, NormalizeError, Normalized, Normalizer,
};
pub use socrata::SocrataAdapter;
pub use tpia::{request_template_path, tpia_file_prefix, TpiaAdapter};

pub const CRATE_NAME: &str = "permitflow-adapters";

pub const DEFAULT_MAX_PAGES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    /// Upper bound on requests per source run.
    pub max_pages: usize,
}

impl AdapterContext {
    pub fn new(started_at: DateTime<Utc>, cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            cancel,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    fn check(&self, pages_so_far: usize) -> Result<(), AdapterError> {
        if self.cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }
        if pages_so_far >= self.max_pages {
            return Err(AdapterError::PageLimit {
                max_pages: self.max_pages,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    /// Shard label for partitioned fetches (letter, day, file date).
    pub partition: Option<String>,
    pub row_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{url}: {message}")]
    Page { url: String, message: String },
    #[error("{url} element {index}: {message}")]
    Element {
        url: String,
        index: usize,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPage {
    pub records: Vec<RawRecord>,
    pub errors: Vec<ParseError>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("upstream error from {url}: {message}")]
    Upstream { url: String, message: String },
    #[error("pagination stopped after {max_pages} pages")]
    PageLimit { max_pages: usize },
    #[error("fetch cancelled")]
    Cancelled,
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            AdapterError::Cancelled => true,
            AdapterError::Fetch(err) => err.is_cancelled(),
            _ => false,
        }
    }

    fn upstream(url: &str, message: impl Into<String>) -> Self {
        AdapterError::Upstream {
            url: url.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn config(&self) -> &SourceConfig;

    fn kind(&self) -> SourceKind {
        self.config().kind
    }

    /// True when the upstream has no server-side incremental filter and the
    /// caller must drop rows older than the cursor.
    fn filters_client_side(&self) -> bool {
        false
    }

    /// Headers sent on every request to this source.
    fn request_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Every page needed to exhaust the window starting at `since`.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<FetchedPage>, AdapterError>;

    fn parse(&self, page: &FetchedPage) -> ParsedPage;

    fn normalizer(&self) -> &Normalizer;

    fn normalize(
        &self,
        raw: &RawRecord,
        updated_at: DateTime<Utc>,
    ) -> Result<Normalized, NormalizeError> {
        self.normalizer().normalize(raw, updated_at)
    }
}

pub fn adapter_for_source(config: &SourceConfig, bounds: GeoBounds) -> Box<dyn SourceAdapter> {
    match config.kind {
        SourceKind::Socrata => Box::new(SocrataAdapter::new(config.clone(), bounds)),
        SourceKind::Arcgis => Box::new(ArcgisAdapter::new(config.clone(), bounds)),
        SourceKind::CsvHttp => Box::new(CsvHttpAdapter::new(config.clone(), bounds)),
        SourceKind::Tpia => Box::new(TpiaAdapter::new(config.clone(), bounds)),
    }
}

/// Keeps rows whose `date_field` is at or after `since`; rows without a
/// parseable date are kept.
pub fn within_window(raw: &RawRecord, date_field: Option<&str>, since: DateTime<Utc>) -> bool {
    let Some(field) = date_field else {
        return true;
    };
    match raw.get(field).and_then(parse_timestamp_value) {
        Some(ts) => ts >= since,
        None => true,
    }
}

fn raw_record(config: &SourceConfig, fields: Map<String, JsonValue>, page: &FetchedPage) -> RawRecord {
    RawRecord::new(fields, &config.id, config.jurisdiction_name(), page.fetched_at)
}

/// JSON array of row objects; non-object elements are counted as errors.
fn parse_json_rows(config: &SourceConfig, page: &FetchedPage, rows: Vec<JsonValue>) -> ParsedPage {
    let mut parsed = ParsedPage::default();
    for (index, row) in rows.into_iter().enumerate() {
        match row {
            JsonValue::Object(fields) => parsed.records.push(raw_record(config, fields, page)),
            other => parsed.errors.push(ParseError::Element {
                url: page.url.clone(),
                index,
                message: format!("expected object, got {}", json_type(&other)),
            }),
        }
    }
    parsed
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Header row plus data rows; rows with the wrong field count are errors.
fn parse_csv_rows(config: &SourceConfig, page: &FetchedPage) -> ParsedPage {
    let mut parsed = ParsedPage::default();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(page.body.as_slice());
    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(err) => {
            parsed.errors.push(ParseError::Page {
                url: page.url.clone(),
                message: format!("reading csv header: {err}"),
            });
            return parsed;
        }
    };
    for (index, row) in reader.records().enumerate() {
        match row {
            Ok(row) => {
                let fields = headers
                    .iter()
                    .zip(row.iter())
                    .map(|(name, value)| (name.to_string(), JsonValue::String(value.to_string())))
                    .collect::<Map<_, _>>();
                parsed.records.push(raw_record(config, fields, page));
            }
            Err(err) => parsed.errors.push(ParseError::Element {
                url: page.url.clone(),
                index,
                message: err.to_string(),
            }),
        }
    }
    parsed
}

/// Data rows in a CSV body, malformed ones included.
fn count_csv_rows(body: &[u8]) -> usize {
    csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(body)
        .records()
        .count()
}
