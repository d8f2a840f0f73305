//! Core domain model for permit ingestion: source configuration, raw and
//! canonical records, ETL state, and the content fingerprint.

mod config;
mod record;

pub use config::{
    ConfigError, ConflictKey, CsvOptions, CsvStrategy, GeoBounds, SourceConfig, SourceKind,
};
pub use record::{
    record_hash, NormalizedRecord, PermitStatus, RawRecord, RunStatus, Watermark,
    CANONICAL_COLUMNS, METADATA_COLUMNS,
};

pub const CRATE_NAME: &str = "permitflow-core";
