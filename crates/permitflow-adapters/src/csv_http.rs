use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use permitflow_core::{CsvStrategy, GeoBounds, SourceConfig};
use permitflow_transport::HttpFetcher;
use tracing::{debug, info};

use crate::{
    count_csv_rows, parse_csv_rows, AdapterContext, AdapterError, FetchedPage, Normalizer,
    ParsedPage, SourceAdapter,
};

/// Plain CSV downloads. There is no server-side date filter, so rows older
/// than the cursor are dropped by the caller.
#[derive(Debug, Clone)]
pub struct CsvHttpAdapter {
    config: SourceConfig,
    normalizer: Normalizer,
}

/// `A`..`Z` then `0`..`9`.
pub fn letter_partitions() -> Vec<String> {
    ('A'..='Z').chain('0'..='9').map(String::from).collect()
}

/// Every calendar day from `since` through `until`, inclusive.
pub fn day_partitions(since: NaiveDate, until: NaiveDate) -> Vec<NaiveDate> {
    since.iter_days().take_while(|d| *d <= until).collect()
}

impl CsvHttpAdapter {
    pub fn new(config: SourceConfig, bounds: GeoBounds) -> Self {
        let normalizer = Normalizer::new(&config, bounds);
        Self { config, normalizer }
    }

    async fn fetch_one(
        &self,
        http: &HttpFetcher,
        query: &[(String, String)],
        partition: Option<String>,
    ) -> Result<FetchedPage, AdapterError> {
        let resp = http.get(&self.config.endpoint, query).await?;
        let row_count = count_csv_rows(&resp.body);
        debug!(partition = partition.as_deref(), row_count, "csv page");
        Ok(FetchedPage {
            url: resp.final_url,
            content_type: "text/csv".to_string(),
            body: resp.body,
            fetched_at: Utc::now(),
            partition,
            row_count,
        })
    }

    async fn fetch_partitions(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        partitions: Vec<String>,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::with_capacity(partitions.len());
        for partition in partitions {
            ctx.check(pages.len())?;
            let query = vec![(self.config.csv.partition_param.clone(), partition.clone())];
            let page = self.fetch_one(http, &query, Some(partition)).await?;
            if page.row_count > 0 {
                pages.push(page);
            }
        }
        Ok(pages)
    }

    async fn fetch_offset_pages(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let page_size = self.config.page_size();
        let mut pages = Vec::new();
        let mut offset = 0usize;
        loop {
            ctx.check(pages.len())?;
            let query = vec![
                (self.config.csv.offset_param.clone(), offset.to_string()),
                (self.config.csv.limit_param.clone(), page_size.to_string()),
            ];
            let page = self.fetch_one(http, &query, None).await?;
            let row_count = page.row_count;
            if row_count > 0 {
                pages.push(page);
            }
            if row_count < page_size {
                break;
            }
            offset += row_count;
        }
        Ok(pages)
    }
}

#[async_trait]
impl SourceAdapter for CsvHttpAdapter {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn filters_client_side(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        since: DateTime<Utc>,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let pages = match self.config.csv.strategy {
            CsvStrategy::Full => {
                ctx.check(0)?;
                vec![self.fetch_one(http, &[], None).await?]
            }
            CsvStrategy::Offset => self.fetch_offset_pages(http, ctx).await?,
            CsvStrategy::Letters => {
                self.fetch_partitions(http, ctx, letter_partitions()).await?
            }
            CsvStrategy::Days => {
                let days = day_partitions(
                    self.config.source_time(since).date_naive(),
                    self.config.source_time(ctx.started_at).date_naive(),
                )
                    .into_iter()
                    .map(|d| d.format(&self.config.csv.date_format).to_string())
                    .collect();
                self.fetch_partitions(http, ctx, days).await?
            }
        };
        info!(
            strategy = ?self.config.csv.strategy,
            pages = pages.len(),
            rows = pages.iter().map(|p| p.row_count).sum::<usize>(),
            "csv fetch complete"
        );
        Ok(pages)
    }

    fn parse(&self, page: &FetchedPage) -> ParsedPage {
        parse_csv_rows(&self.config, page)
    }

    fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permitflow_core::SourceKind;
    use permitflow_transport::HttpClientConfig;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: String, strategy: CsvStrategy) -> SourceConfig {
        let mut config = SourceConfig::new("plano_permits", SourceKind::CsvHttp, endpoint);
        config.date_field = Some("issue_date".into());
        config.csv.strategy = strategy;
        config
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn partitions_cover_expected_keys() {
        let letters = letter_partitions();
        assert_eq!(letters.len(), 36);
        assert_eq!(letters.first().map(String::as_str), Some("A"));
        assert_eq!(letters.last().map(String::as_str), Some("9"));

        let days = day_partitions(
            NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(),
            NaiveDate::from_ymd_opt(2025, 2, 2).unwrap(),
        );
        assert_eq!(days.len(), 4);
        assert!(day_partitions(
            NaiveDate::from_ymd_opt(2025, 2, 3).unwrap(),
            NaiveDate::from_ymd_opt(2025, 2, 2).unwrap()
        )
        .is_empty());
    }

    #[tokio::test]
    async fn full_download_is_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("permit_number,issue_date\nP1,2025-01-14\nP2,2025-01-02\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let adapter = CsvHttpAdapter::new(config(server.uri(), CsvStrategy::Full), GeoBounds::default());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(Utc::now(), CancellationToken::new());
        let pages = adapter.fetch(&http, &ctx, ts("2025-01-10T00:00:00Z")).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].row_count, 2);
        assert_eq!(adapter.parse(&pages[0]).records.len(), 2);
    }

    #[tokio::test]
    async fn offset_strategy_pages_with_configured_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("start", "0"))
            .and(query_param("rows", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("permit_number\nA\nB\n"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("start", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("permit_number\nC\n"))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = config(server.uri(), CsvStrategy::Offset);
        cfg.csv.offset_param = "start".into();
        cfg.csv.limit_param = "rows".into();
        cfg.page_size_hint = Some(2);
        let adapter = CsvHttpAdapter::new(cfg, GeoBounds::default());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(Utc::now(), CancellationToken::new());
        let pages = adapter.fetch(&http, &ctx, Utc::now()).await.unwrap();
        assert_eq!(pages.iter().map(|p| p.row_count).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[tokio::test]
    async fn day_strategy_requests_each_day_through_run_start() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("permit_number,issue_date\nA,2025-01-14\n"))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri(), CsvStrategy::Days);
        cfg.csv.partition_param = "day".into();
        let adapter = CsvHttpAdapter::new(cfg, GeoBounds::default());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(ts("2025-01-15T06:00:00Z"), CancellationToken::new());
        let pages = adapter
            .fetch(&http, &ctx, ts("2025-01-13T10:29:00Z"))
            .await
            .unwrap();

        let partitions: Vec<_> = pages.iter().filter_map(|p| p.partition.clone()).collect();
        assert_eq!(partitions, vec!["2025-01-13", "2025-01-14", "2025-01-15"]);
        let requests = server.received_requests().await.unwrap();
        assert!(requests
            .iter()
            .any(|r| r.url.query() == Some("day=2025-01-14")));
    }

    #[tokio::test]
    async fn cancelled_context_stops_before_requesting() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let adapter = CsvHttpAdapter::new(config(server.uri(), CsvStrategy::Letters), GeoBounds::default());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(Utc::now(), cancel);
        let err = adapter.fetch(&http, &ctx, Utc::now()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
