use async_trait::async_trait;
use chrono::{DateTime, Utc};
use permitflow_core::{GeoBounds, SourceConfig};
use permitflow_transport::HttpFetcher;
use serde::de::IgnoredAny;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{
    parse_json_rows, AdapterContext, AdapterError, FetchedPage, Normalizer, ParseError, ParsedPage,
    SourceAdapter,
};

/// SODA JSON endpoints, paged with `$limit`/`$offset`.
#[derive(Debug, Clone)]
pub struct SocrataAdapter {
    config: SourceConfig,
    normalizer: Normalizer,
}

impl SocrataAdapter {
    pub fn new(config: SourceConfig, bounds: GeoBounds) -> Self {
        let normalizer = Normalizer::new(&config, bounds);
        Self { config, normalizer }
    }

    /// `$where` predicate for the window, ANDed with any configured clause.
    pub fn where_clause(&self, since: DateTime<Utc>) -> Option<String> {
        let since = self.config.source_time(since);
        let incremental = self.config.date_field.as_ref().map(|field| {
            format!("{field} >= '{}'", since.format("%Y-%m-%dT%H:%M:%S%.3f"))
        });
        match (incremental, self.config.where_clause.as_deref()) {
            (Some(a), Some(b)) => Some(format!("({a}) AND ({b})")),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b.to_string()),
            (None, None) => None,
        }
    }

    fn order_clause(&self) -> String {
        match &self.config.date_field {
            Some(field) => format!("{field} ASC, :id"),
            None => ":id".to_string(),
        }
    }
}

fn count_rows(url: &str, body: &[u8]) -> Result<usize, AdapterError> {
    if let Ok(rows) = serde_json::from_slice::<Vec<IgnoredAny>>(body) {
        return Ok(rows.len());
    }
    let message = serde_json::from_slice::<JsonValue>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(JsonValue::as_str).map(str::to_string))
        .unwrap_or_else(|| "response is not a JSON array".to_string());
    Err(AdapterError::upstream(url, message))
}

#[async_trait]
impl SourceAdapter for SocrataAdapter {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        self.config
            .app_token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|token| !token.trim().is_empty())
            .map(|token| vec![("X-App-Token".to_string(), token)])
            .unwrap_or_default()
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let page_size = self.config.page_size();
        let where_clause = self.where_clause(since);
        let order = self.order_clause();
        let mut pages = Vec::new();
        let mut offset = 0usize;

        loop {
            ctx.check(pages.len())?;
            let mut query = vec![
                ("$limit".to_string(), page_size.to_string()),
                ("$offset".to_string(), offset.to_string()),
                ("$order".to_string(), order.clone()),
            ];
            if let Some(clause) = &where_clause {
                query.push(("$where".to_string(), clause.clone()));
            }

            let resp = http.get(&self.config.endpoint, &query).await?;
            let row_count = count_rows(&resp.final_url, &resp.body)?;
            debug!(offset, row_count, "socrata page");
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
            if row_count < page_size {
                break;
            }
            offset += row_count;
        }

        info!(
            pages = pages.len(),
            rows = pages.iter().map(|p| p.row_count).sum::<usize>(),
            "socrata fetch complete"
        );
        Ok(pages)
    }

    fn parse(&self, page: &FetchedPage) -> ParsedPage {
        match serde_json::from_slice::<Vec<JsonValue>>(&page.body) {
            Ok(rows) => parse_json_rows(&self.config, page, rows),
            Err(err) => ParsedPage {
                records: Vec::new(),
                errors: vec![ParseError::Page {
                    url: page.url.clone(),
                    message: err.to_string(),
                }],
            },
        }
    }

    fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }
}
