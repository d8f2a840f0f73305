//! Raw source fields to canonical permit records.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use permitflow_core::{GeoBounds, NormalizedRecord, PermitStatus, RawRecord, SourceConfig};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Fallback source field names per canonical field, tried in order after
/// any `field_map` entries.
pub const ALIASES: &[(&str, &[&str])] = &[
    (
        "permit_id",
        &[
            "permit_id",
            "permit_number",
            "permit_num",
            "permitnumber",
            "permitnum",
            "permit_no",
            "permit",
            "record_id",
            "case_number",
            "folder_number",
            "application_number",
        ],
    ),
    ("city", &["city", "original_city", "project_city"]),
    ("county", &["county", "county_name"]),
    ("state", &["state", "original_state"]),
    (
        "status",
        &[
            "status",
            "permit_status",
            "status_current",
            "statuscurrent",
            "current_status",
            "record_status",
        ],
    ),
    (
        "permit_type",
        &[
            "permit_type",
            "permittype",
            "permit_type_desc",
            "work_type",
            "work_class",
            "permit_class",
            "record_type",
            "type",
        ],
    ),
    (
        "description",
        &[
            "description",
            "work_description",
            "project_description",
            "scope_of_work",
            "comments",
        ],
    ),
    (
        "address",
        &[
            "address",
            "original_address1",
            "street_address",
            "full_address",
            "site_address",
            "project_address",
            "location_address",
        ],
    ),
    ("postal_code", &["postal_code", "zip", "zip_code", "zipcode", "original_zip"]),
    (
        "valuation",
        &[
            "valuation",
            "total_valuation",
            "project_valuation",
            "job_value",
            "total_job_valuation",
            "declared_valuation",
            "estimated_cost",
            "value",
        ],
    ),
    (
        "applied_at",
        &[
            "applied_at",
            "applied_date",
            "applieddate",
            "application_date",
            "submitted_date",
            "file_date",
            "date_applied",
        ],
    ),
    (
        "issued_at",
        &[
            "issued_at",
            "issued_date",
            "issue_date",
            "issueddate",
            "date_issued",
            "permit_issued_date",
        ],
    ),
    (
        "finaled_at",
        &[
            "finaled_at",
            "final_date",
            "finaled_date",
            "completed_date",
            "completion_date",
            "date_finaled",
            "closed_date",
        ],
    ),
    ("latitude", &["latitude", "lat"]),
    ("longitude", &["longitude", "lon", "lng", "long"]),
    (
        "contractor_name",
        &["contractor_name", "contractor", "contractor_company_name", "contractor_full_name"],
    ),
    (
        "contractor_license",
        &["contractor_license", "contractor_license_number", "license_number"],
    ),
    ("url", &["url", "permit_url", "link"]),
];

/// Point-valued columns searched when no scalar coordinates exist.
const LOCATION_FIELDS: &[&str] = &["location", "geocoded_column", "the_geom", "geometry"];

const STATUS_TABLE: &[(&str, PermitStatus)] = &[
    ("active", PermitStatus::Active),
    ("issued", PermitStatus::Active),
    ("permit issued", PermitStatus::Active),
    ("reissued", PermitStatus::Active),
    ("open", PermitStatus::Active),
    ("approved", PermitStatus::Active),
    ("in progress", PermitStatus::Active),
    ("inspections", PermitStatus::Active),
    ("under inspection", PermitStatus::Active),
    ("final", PermitStatus::Closed),
    ("finaled", PermitStatus::Closed),
    ("closed", PermitStatus::Closed),
    ("complete", PermitStatus::Closed),
    ("completed", PermitStatus::Closed),
    ("expired", PermitStatus::Closed),
    ("co issued", PermitStatus::Closed),
    ("certificate of occupancy", PermitStatus::Closed),
    ("pending", PermitStatus::Pending),
    ("applied", PermitStatus::Pending),
    ("submitted", PermitStatus::Pending),
    ("received", PermitStatus::Pending),
    ("application received", PermitStatus::Pending),
    ("in review", PermitStatus::Pending),
    ("under review", PermitStatus::Pending),
    ("plan review", PermitStatus::Pending),
    ("on hold", PermitStatus::Pending),
    ("hold", PermitStatus::Pending),
    ("cancelled", PermitStatus::Cancelled),
    ("canceled", PermitStatus::Cancelled),
    ("void", PermitStatus::Cancelled),
    ("voided", PermitStatus::Cancelled),
    ("withdrawn", PermitStatus::Cancelled),
    ("revoked", PermitStatus::Cancelled),
    ("denied", PermitStatus::Cancelled),
    ("rejected", PermitStatus::Cancelled),
];

const PERMIT_TYPE_TABLE: &[(&str, &str)] = &[
    ("new", "NEW_CONSTRUCTION"),
    ("new construction", "NEW_CONSTRUCTION"),
    ("new building", "NEW_CONSTRUCTION"),
    ("building - new", "NEW_CONSTRUCTION"),
    ("addition", "ADDITION"),
    ("alteration", "ALTERATION"),
    ("remodel", "ALTERATION"),
    ("renovation", "ALTERATION"),
    ("repair", "ALTERATION"),
    ("finish out", "ALTERATION"),
    ("interior finish out", "ALTERATION"),
    ("demolition", "DEMOLITION"),
    ("demo", "DEMOLITION"),
    ("wrecking", "DEMOLITION"),
    ("electrical", "ELECTRICAL"),
    ("electric", "ELECTRICAL"),
    ("plumbing", "PLUMBING"),
    ("mechanical", "MECHANICAL"),
    ("hvac", "MECHANICAL"),
    ("roof", "ROOFING"),
    ("roofing", "ROOFING"),
    ("reroof", "ROOFING"),
    ("re-roof", "ROOFING"),
    ("solar", "SOLAR"),
    ("solar pv", "SOLAR"),
    ("photovoltaic", "SOLAR"),
    ("pool", "POOL"),
    ("swimming pool", "POOL"),
    ("pool/spa", "POOL"),
    ("sign", "SIGN"),
    ("signage", "SIGN"),
    ("fence", "FENCE"),
];

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d", "%d-%b-%Y"];

/// Epoch values at or above this are milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("record from `{source_id}` has no permit id")]
    MissingPermitId { source_id: String },
}

/// A value that could not be coerced; the field is stored as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: &'static str,
    pub value: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub record: NormalizedRecord,
    pub issues: Vec<FieldIssue>,
}

/// Per-source normalization settings, built once from the source config.
#[derive(Debug, Clone)]
pub struct Normalizer {
    source_id: String,
    jurisdiction: String,
    city: Option<String>,
    county: Option<String>,
    state: Option<String>,
    url_template: Option<String>,
    bounds: GeoBounds,
    /// canonical field -> configured source fields
    mapped: BTreeMap<String, Vec<String>>,
}

impl Normalizer {
    pub fn new(config: &SourceConfig, bounds: GeoBounds) -> Self {
        let mut mapped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (source_field, canonical) in &config.field_map {
            mapped
                .entry(canonical.clone())
                .or_default()
                .push(source_field.clone());
        }
        Self {
            source_id: config.id.clone(),
            jurisdiction: config.jurisdiction_name().to_string(),
            city: config.city.clone(),
            county: config.county.clone(),
            state: config.state.clone(),
            url_template: config.url_template.clone(),
            bounds,
            mapped,
        }
    }

    fn candidates<'a>(&'a self, canonical: &str) -> impl Iterator<Item = &'a str> {
        let mapped = self
            .mapped
            .get(canonical)
            .into_iter()
            .flatten()
            .map(String::as_str);
        let aliases = ALIASES
            .iter()
            .find(|(name, _)| *name == canonical)
            .map(|(_, aliases)| *aliases)
            .unwrap_or(&[]);
        mapped.chain(aliases.iter().copied())
    }

    /// First usable value among the candidate source fields.
    pub fn lookup<'r>(&self, raw: &'r RawRecord, canonical: &str) -> Option<&'r JsonValue> {
        self.candidates(canonical)
            .filter_map(|name| raw.get(name))
            .find(|value| !is_blank(value))
    }

    fn text(&self, raw: &RawRecord, canonical: &str) -> Option<String> {
        self.lookup(raw, canonical).and_then(value_text)
    }

    pub fn normalize(
        &self,
        raw: &RawRecord,
        updated_at: DateTime<Utc>,
    ) -> Result<Normalized, NormalizeError> {
        let mut issues = Vec::new();

        let permit_id = self
            .text(raw, "permit_id")
            .ok_or_else(|| NormalizeError::MissingPermitId {
                source_id: self.source_id.clone(),
            })?;

        let mut date = |field: &'static str| -> Option<DateTime<Utc>> {
            let value = self.lookup(raw, field)?;
            let parsed = parse_timestamp_value(value);
            if parsed.is_none() {
                issues.push(FieldIssue::new(field, value, "unparseable date"));
            }
            parsed
        };
        let applied_at = date("applied_at");
        let issued_at = date("issued_at");
        let finaled_at = date("finaled_at");

        let valuation = self.lookup(raw, "valuation").and_then(|value| {
            let parsed = parse_money_value(value);
            if parsed.is_none() {
                issues.push(FieldIssue::new("valuation", value, "invalid amount"));
            }
            parsed
        });

        let postal_code = self.lookup(raw, "postal_code").and_then(|value| {
            let parsed = value_text(value).and_then(|text| normalize_postal_code(&text));
            if parsed.is_none() {
                issues.push(FieldIssue::new("postal_code", value, "not a ZIP code"));
            }
            parsed
        });

        let (latitude, longitude) = self.coordinates(raw, &mut issues);

        let status = match self.text(raw, "status") {
            Some(text) => canonical_status(&text),
            None if finaled_at.is_some() => PermitStatus::Closed,
            None if issued_at.is_some() => PermitStatus::Active,
            None => PermitStatus::Pending,
        };

        let url = self.text(raw, "url").or_else(|| {
            self.url_template
                .as_ref()
                .map(|template| template.replace("{permit_id}", &permit_id))
        });

        let record = NormalizedRecord {
            source_id: self.source_id.clone(),
            jurisdiction: self.jurisdiction.clone(),
            city: self.text(raw, "city").or_else(|| self.city.clone()),
            county: self.text(raw, "county").or_else(|| self.county.clone()),
            state: self
                .text(raw, "state")
                .or_else(|| self.state.clone())
                .map(|s| s.to_uppercase()),
            status,
            permit_type: self.text(raw, "permit_type").map(|t| canonical_permit_type(&t)),
            description: self.text(raw, "description"),
            address: self.text(raw, "address"),
            postal_code,
            valuation,
            applied_at,
            issued_at,
            finaled_at,
            latitude,
            longitude,
            contractor_name: self.text(raw, "contractor_name"),
            contractor_license: self.text(raw, "contractor_license"),
            url,
            permit_id,
            record_hash: String::new(),
            updated_at,
        }
        .seal();

        Ok(Normalized { record, issues })
    }

    fn coordinates(&self, raw: &RawRecord, issues: &mut Vec<FieldIssue>) -> (Option<f64>, Option<f64>) {
        let lat = self.lookup(raw, "latitude");
        let lon = self.lookup(raw, "longitude");
        let pair = match (lat, lon) {
            (Some(lat), Some(lon)) => Some((parse_number_value(lat), parse_number_value(lon))),
            (None, None) => LOCATION_FIELDS
                .iter()
                .filter_map(|name| raw.get(name))
                .find_map(point_from_value)
                .map(|(lat, lon)| (Some(lat), Some(lon))),
            _ => {
                issues.push(FieldIssue {
                    field: "latitude",
                    value: String::new(),
                    reason: "coordinate pair incomplete",
                });
                None
            }
        };
        match pair {
            Some((Some(lat), Some(lon))) if self.bounds.contains(lat, lon) => (Some(lat), Some(lon)),
            Some((lat, lon)) => {
                issues.push(FieldIssue {
                    field: "latitude",
                    value: format!("{lat:?},{lon:?}"),
                    reason: "coordinates outside bounding box",
                });
                (None, None)
            }
            None => (None, None),
        }
    }
}

impl FieldIssue {
    fn new(field: &'static str, value: &JsonValue, reason: &'static str) -> Self {
        let value = match value {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self { field, value, reason }
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => {
            let s = s.trim();
            s.is_empty()
                || s.eq_ignore_ascii_case("n/a")
                || s.eq_ignore_ascii_case("na")
                || s.eq_ignore_ascii_case("null")
                || s.eq_ignore_ascii_case("none")
        }
        _ => false,
    }
}

/// Whitespace-collapsed text; structured values have no text form.
fn value_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => collapse_whitespace(s),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn canonical_status(input: &str) -> PermitStatus {
    let key = collapse_whitespace(input).to_lowercase();
    STATUS_TABLE
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, status)| status.clone())
        .unwrap_or_else(|| PermitStatus::Other(key.to_uppercase()))
}

pub fn canonical_permit_type(input: &str) -> String {
    let key = collapse_whitespace(input).to_lowercase();
    PERMIT_TYPE_TABLE
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| key.to_uppercase())
}

/// Leading five digits of a US ZIP or ZIP+4.
pub fn normalize_postal_code(input: &str) -> Option<String> {
    let digits: String = input.trim().chars().take_while(char::is_ascii_digit).collect();
    (digits.len() >= 5).then(|| digits[..5].to_string())
}

pub fn parse_money(input: &str) -> Option<f64> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$' && *c != ',')
        .collect();
    let amount = cleaned.parse::<f64>().ok()?;
    (amount.is_finite() && amount >= 0.0).then_some(amount)
}

fn parse_money_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().filter(|v| v.is_finite() && *v >= 0.0),
        JsonValue::String(s) => parse_money(s),
        _ => None,
    }
}

fn parse_number_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// Socrata point objects, GeoJSON points, and ArcGIS `{x, y}` geometries.
fn point_from_value(value: &JsonValue) -> Option<(f64, f64)> {
    let object = value.as_object()?;
    if let (Some(lat), Some(lon)) = (object.get("latitude"), object.get("longitude")) {
        return Some((parse_number_value(lat)?, parse_number_value(lon)?));
    }
    if let Some(coords) = object.get("coordinates").and_then(JsonValue::as_array) {
        if let [lon, lat, ..] = coords.as_slice() {
            return Some((parse_number_value(lat)?, parse_number_value(lon)?));
        }
    }
    if let (Some(x), Some(y)) = (object.get("x"), object.get("y")) {
        return Some((parse_number_value(y)?, parse_number_value(x)?));
    }
    None
}

/// Timestamp from a string in any known layout or a numeric epoch.
/// Naive values are taken as UTC.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(input, format) {
            return Some(Utc.from_utc_datetime(&ts));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(input, format) {
            return date.and_hms_opt(0, 0, 0).map(|ts| Utc.from_utc_datetime(&ts));
        }
    }
    input.parse::<f64>().ok().and_then(from_epoch)
}

pub fn parse_timestamp_value(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => parse_timestamp(s),
        JsonValue::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = if value >= EPOCH_MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis as i64)
}
