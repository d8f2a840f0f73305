use async_trait::async_trait;
use chrono::{DateTime, Utc};
use permitflow_core::{GeoBounds, SourceConfig};
use permitflow_transport::HttpFetcher;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{
    raw_record, AdapterContext, AdapterError, FetchedPage, Normalizer, ParseError, ParsedPage,
    SourceAdapter,
};

/// ArcGIS REST feature layers, paged with `resultOffset`.
#[derive(Debug, Clone)]
pub struct ArcgisAdapter {
    config: SourceConfig,
    normalizer: Normalizer,
}

#[derive(Debug, Deserialize)]
struct LayerMetadata {
    #[serde(rename = "maxRecordCount")]
    max_record_count: Option<usize>,
    #[serde(rename = "objectIdField")]
    object_id_field: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct FeatureSet {
    #[serde(default)]
    features: Vec<JsonValue>,
    #[serde(rename = "exceededTransferLimit", default)]
    exceeded_transfer_limit: bool,
}

/// Never request more than the server ceiling.
pub fn clamp_page_size(configured: usize, max_record_count: Option<usize>) -> usize {
    match max_record_count {
        Some(ceiling) if ceiling > 0 => configured.min(ceiling),
        _ => configured,
    }
    .max(1)
}

/// Date order alone is not stable across offset pages when many features
/// share a timestamp, so the object id always breaks ties.
pub fn order_by_fields(date_field: Option<&str>, object_id_field: Option<&str>) -> String {
    let object_id = object_id_field
        .filter(|f| !f.trim().is_empty())
        .unwrap_or("OBJECTID");
    match date_field.filter(|f| !f.trim().is_empty()) {
        Some(date) if date != object_id => format!("{date} ASC, {object_id} ASC"),
        _ => format!("{object_id} ASC"),
    }
}

/// `{"error": {"code": .., "message": ..}}` arrives with HTTP 200.
fn error_envelope(body: &JsonValue) -> Option<String> {
    let error = body.get("error")?;
    let code = error.get("code").and_then(JsonValue::as_i64);
    let message = error
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("unspecified error");
    let details = error
        .get("details")
        .and_then(JsonValue::as_array)
        .map(|d| {
            d.iter()
                .filter_map(JsonValue::as_str)
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|d| !d.is_empty());
    Some(match (code, details) {
        (Some(code), Some(details)) => format!("{code} {message} ({details})"),
        (Some(code), None) => format!("{code} {message}"),
        (None, Some(details)) => format!("{message} ({details})"),
        (None, None) => message.to_string(),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(url: &str, body: &[u8]) -> Result<T, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| AdapterError::upstream(url, format!("invalid JSON: {e}")))?;
    if let Some(message) = error_envelope(&value) {
        return Err(AdapterError::upstream(url, message));
    }
    serde_json::from_value(value)
        .map_err(|e| AdapterError::upstream(url, format!("unexpected response shape: {e}")))
}

impl ArcgisAdapter {
    pub fn new(config: SourceConfig, bounds: GeoBounds) -> Self {
        let normalizer = Normalizer::new(&config, bounds);
        Self { config, normalizer }
    }

    fn layer_url(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    fn query_url(&self) -> String {
        format!("{}/query", self.layer_url())
    }

    pub fn where_clause(&self, since: DateTime<Utc>) -> String {
        let since = self.config.source_time(since);
        let incremental = self.config.date_field.as_ref().map(|field| {
            format!(
                "{field} >= TIMESTAMP '{}'",
                since.format("%Y-%m-%d %H:%M:%S")
            )
        });
        match (incremental, self.config.where_clause.as_deref()) {
            (Some(a), Some(b)) => format!("({a}) AND ({b})"),
            (Some(a), None) => a,
            (None, Some(b)) => b.to_string(),
            (None, None) => "1=1".to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for ArcgisAdapter {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        ctx.check(0)?;
        let meta_resp = http
            .get(self.layer_url(), &[("f".to_string(), "json".to_string())])
            .await?;
        let meta: LayerMetadata = decode(&meta_resp.final_url, &meta_resp.body)?;
        let page_size = clamp_page_size(self.config.page_size(), meta.max_record_count);
        let order_by = order_by_fields(
            self.config.date_field.as_deref(),
            meta.object_id_field.as_deref(),
        );

        let where_clause = self.where_clause(since);
        let query_url = self.query_url();

        let count_resp = http
            .get(
                &query_url,
                &[
                    ("where".to_string(), where_clause.clone()),
                    ("returnCountOnly".to_string(), "true".to_string()),
                    ("f".to_string(), "json".to_string()),
                ],
            )
            .await?;
        let total = decode::<CountResponse>(&count_resp.final_url, &count_resp.body)?.count;
        info!(
            total,
            page_size,
            max_record_count = meta.max_record_count,
            "arcgis window"
        );

        let mut pages = Vec::new();
        let mut offset = 0usize;
        while offset < total {
            ctx.check(pages.len())?;
            let query = vec![
                ("where".to_string(), where_clause.clone()),
                ("outFields".to_string(), "*".to_string()),
                ("outSR".to_string(), "4326".to_string()),
                ("returnGeometry".to_string(), "true".to_string()),
                ("orderByFields".to_string(), order_by.clone()),
                ("resultOffset".to_string(), offset.to_string()),
                ("resultRecordCount".to_string(), page_size.to_string()),
                ("f".to_string(), "json".to_string()),
            ];
            let resp = http.get(&query_url, &query).await?;
            let set: FeatureSet = decode(&resp.final_url, &resp.body)?;
            let row_count = set.features.len();
            debug!(offset, row_count, exceeded = set.exceeded_transfer_limit, "arcgis page");
            if row_count > 0 {
                pages.push(FetchedPage {
                    url: resp.final_url,
                    content_type: "application/json".to_string(),
                    body: resp.body,
                    fetched_at: Utc::now(),
                    partition: None,
                    row_count,
                });
            }
            offset += row_count;
            if row_count < page_size && !set.exceeded_transfer_limit {
                break;
            }
            if row_count == 0 {
                break;
            }
        }

        if offset < total {
            warn!(fetched = offset, total, "arcgis returned fewer rows than counted");
        }
        Ok(pages)
    }

    fn parse(&self, page: &FetchedPage) -> ParsedPage {
        let set = match decode::<FeatureSet>(&page.url, &page.body) {
            Ok(set) => set,
            Err(err) => {
                return ParsedPage {
                    records: Vec::new(),
                    errors: vec![ParseError::Page {
                        url: page.url.clone(),
                        message: err.to_string(),
                    }],
                }
            }
        };

        let mut parsed = ParsedPage::default();
        for (index, feature) in set.features.into_iter().enumerate() {
            let Some(mut attributes) = feature
                .get("attributes")
                .and_then(JsonValue::as_object)
                .cloned()
            else {
                parsed.errors.push(ParseError::Element {
                    url: page.url.clone(),
                    index,
                    message: "feature without attributes".to_string(),
                });
                continue;
            };
            surface_geometry(&mut attributes, feature.get("geometry"));
            parsed.records.push(raw_record(&self.config, attributes, page));
        }
        parsed
    }

    fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }
}

/// Point geometry `{x, y}` becomes `longitude` / `latitude` unless the layer
/// already carries those attributes.
fn surface_geometry(attributes: &mut Map<String, JsonValue>, geometry: Option<&JsonValue>) {
    let Some(geometry) = geometry else {
        return;
    };
    let (Some(x), Some(y)) = (geometry.get("x"), geometry.get("y")) else {
        return;
    };
    if !attributes.keys().any(|k| k.eq_ignore_ascii_case("longitude")) {
        attributes.insert("longitude".to_string(), x.clone());
    }
    if !attributes.keys().any(|k| k.eq_ignore_ascii_case("latitude")) {
        attributes.insert("latitude".to_string(), y.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permitflow_core::SourceKind;
    use permitflow_transport::HttpClientConfig;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(endpoint: String) -> ArcgisAdapter {
        let mut config = SourceConfig::new("fort_worth_permits", SourceKind::Arcgis, endpoint);
        config.date_field = Some("Status_Date".into());
        ArcgisAdapter::new(config, GeoBounds::default())
    }

    fn features(start: usize, n: usize) -> JsonValue {
        let features: Vec<_> = (start..start + n)
            .map(|i| {
                json!({
                    "attributes": {"Permit_No": format!("PB25-{i:05}"), "Status_Date": 1736937000000i64},
                    "geometry": {"x": -97.33, "y": 32.75}
                })
            })
            .collect();
        json!({ "features": features })
    }

    #[test]
    fn clamp_respects_server_ceiling() {
        assert_eq!(clamp_page_size(2000, Some(500)), 500);
        assert_eq!(clamp_page_size(2000, Some(5000)), 2000);
        assert_eq!(clamp_page_size(2000, None), 2000);
        assert_eq!(clamp_page_size(2000, Some(0)), 2000);
    }

    #[test]
    fn object_id_breaks_date_ties() {
        assert_eq!(
            order_by_fields(Some("Status_Date"), Some("FID")),
            "Status_Date ASC, FID ASC"
        );
        assert_eq!(
            order_by_fields(Some("Status_Date"), None),
            "Status_Date ASC, OBJECTID ASC"
        );
        assert_eq!(order_by_fields(None, Some("FID")), "FID ASC");
        assert_eq!(order_by_fields(Some("OBJECTID"), Some("OBJECTID")), "OBJECTID ASC");
    }

    #[test]
    fn where_clause_uses_timestamp_literal() {
        let since = DateTime::parse_from_rfc3339("2025-01-15T10:29:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            adapter("https://x/FeatureServer/0".into()).where_clause(since),
            "Status_Date >= TIMESTAMP '2025-01-15 10:29:00'"
        );
    }

    #[tokio::test]
    async fn pages_never_exceed_max_record_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/FeatureServer/0"))
            .and(query_param("f", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "maxRecordCount": 500,
                "objectIdField": "OBJECTID"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/FeatureServer/0/query"))
            .and(query_param("returnCountOnly", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 1200})))
            .mount(&server)
            .await;
        for (offset, n) in [(0, 500), (500, 500), (1000, 200)] {
            Mock::given(method("GET"))
                .and(path("/FeatureServer/0/query"))
                .and(query_param("resultOffset", offset.to_string()))
                .and(query_param("orderByFields", "Status_Date ASC, OBJECTID ASC"))
                .respond_with(ResponseTemplate::new(200).set_body_json(features(offset, n)))
                .expect(1)
                .mount(&server)
                .await;
        }

        let adapter = adapter(format!("{}/FeatureServer/0", server.uri()));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(Utc::now(), CancellationToken::new());
        let since = Utc::now() - chrono::Duration::days(7);
        let pages = adapter.fetch(&http, &ctx, since).await.unwrap();
        assert_eq!(pages.iter().map(|p| p.row_count).sum::<usize>(), 1200);

        for request in server.received_requests().await.unwrap() {
            if let Some((_, count)) = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "resultRecordCount")
            {
                assert!(count.parse::<usize>().unwrap() <= 500);
            }
        }

        let parsed = adapter.parse(&pages[0]);
        let first = &parsed.records[0];
        assert_eq!(first.get("latitude"), Some(&json!(32.75)));
        assert_eq!(first.get("longitude"), Some(&json!(-97.33)));
        let normalized = adapter.normalize(first, Utc::now()).unwrap().record;
        assert_eq!(normalized.permit_id, "PB25-00000");
        assert_eq!(normalized.latitude, Some(32.75));
    }

    async fn mount_layer(server: &MockServer, max_record_count: usize, count: usize) {
        Mock::given(method("GET"))
            .and(path("/FeatureServer/0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "maxRecordCount": max_record_count,
                "objectIdField": "OBJECTID"
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/FeatureServer/0/query"))
            .and(query_param("returnCountOnly", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": count})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn exceeded_transfer_limit_keeps_paging_after_short_page() {
        let server = MockServer::start().await;
        mount_layer(&server, 3, 5).await;
        let mut first = features(0, 2);
        first["exceededTransferLimit"] = json!(true);
        Mock::given(method("GET"))
            .and(path("/FeatureServer/0/query"))
            .and(query_param("resultOffset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/FeatureServer/0/query"))
            .and(query_param("resultOffset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(features(2, 3)))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(format!("{}/FeatureServer/0", server.uri()));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(Utc::now(), CancellationToken::new());
        let pages = adapter.fetch(&http, &ctx, Utc::now()).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages.iter().map(|p| p.row_count).sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn short_page_without_transfer_limit_ends_below_count() {
        let server = MockServer::start().await;
        mount_layer(&server, 1000, 10).await;
        Mock::given(method("GET"))
            .and(path("/FeatureServer/0/query"))
            .and(query_param("resultOffset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(features(0, 4)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/FeatureServer/0/query"))
            .and(query_param("resultOffset", "4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(features(4, 6)))
            .expect(0)
            .mount(&server)
            .await;

        let adapter = adapter(format!("{}/FeatureServer/0", server.uri()));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(Utc::now(), CancellationToken::new());
        let pages = adapter.fetch(&http, &ctx, Utc::now()).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].row_count, 4);
    }

    #[tokio::test]
    async fn error_envelope_with_http_200_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": {"code": 400, "message": "Invalid or missing input parameters.", "details": []}
            })))
            .mount(&server)
            .await;

        let adapter = adapter(format!("{}/FeatureServer/0", server.uri()));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(Utc::now(), CancellationToken::new());
        let err = adapter.fetch(&http, &ctx, Utc::now()).await.unwrap_err();
        match err {
            AdapterError::Upstream { message, .. } => {
                assert_eq!(message, "400 Invalid or missing input parameters.")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn features_without_attributes_are_counted() {
        let adapter = adapter("https://x/FeatureServer/0".into());
        let page = FetchedPage {
            url: "https://x/FeatureServer/0/query".into(),
            content_type: "application/json".into(),
            body: serde_json::to_vec(&json!({"features": [{"geometry": {}}, {"attributes": {"Permit_No": "A"}}]}))
                .unwrap(),
            fetched_at: Utc::now(),
            partition: None,
            row_count: 2,
        };
        let parsed = adapter.parse(&page);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.errors.len(), 1);
    }
}
