use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use permitflow_core::{GeoBounds, SourceConfig};
use permitflow_transport::HttpFetcher;
use tracing::{info, warn};

use crate::{
    count_csv_rows, parse_csv_rows, AdapterContext, AdapterError, FetchedPage, Normalizer,
    ParsedPage, SourceAdapter,
};

/// Manually delivered CSV files from public-information requests, dropped
/// into the endpoint directory as `<jurisdiction>_permits_<YYYY-MM-DD>.csv`.
#[derive(Debug, Clone)]
pub struct TpiaAdapter {
    config: SourceConfig,
    normalizer: Normalizer,
}

fn jurisdiction_slug(jurisdiction: &str) -> String {
    jurisdiction
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

pub fn tpia_file_prefix(jurisdiction: &str) -> String {
    format!("{}_permits_", jurisdiction_slug(jurisdiction))
}

pub fn request_template_path(dir: &Path, jurisdiction: &str) -> PathBuf {
    dir.join(format!("{}_tpia_request.md", jurisdiction_slug(jurisdiction)))
}

/// Delivery date encoded in a file name, if it follows the convention.
fn delivery_date(file_name: &str, prefix: &str) -> Option<NaiveDate> {
    let date = file_name.strip_prefix(prefix)?.strip_suffix(".csv")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn render_request(jurisdiction: &str, today: NaiveDate, file_prefix: &str) -> String {
    format!(
        "# Public Information Request: Building Permits\n\n\
         To: Public Information Officer, {jurisdiction}\n\
         Date: {today}\n\n\
         Under the Texas Public Information Act (Gov't Code ch. 552), I request a copy of\n\
         all building permit records issued, applied for, or updated by {jurisdiction}\n\
         since the date of the previous request, in CSV format, including:\n\n\
         - permit number\n\
         - permit type and work class\n\
         - status\n\
         - application, issue and final dates\n\
         - project address and ZIP code\n\
         - declared valuation\n\
         - work description\n\
         - contractor name and license number\n\
         - latitude and longitude, where recorded\n\n\
         Electronic delivery is preferred.\n\n\
         ---\n\n\
         When the response arrives, save it in this directory as\n\
         `{file_prefix}YYYY-MM-DD.csv` using the delivery date.\n"
    )
}

impl TpiaAdapter {
    pub fn new(config: SourceConfig, bounds: GeoBounds) -> Self {
        let normalizer = Normalizer::new(&config, bounds);
        Self { config, normalizer }
    }

    fn dir(&self) -> &Path {
        Path::new(&self.config.endpoint)
    }

    /// Matching deliveries, oldest first.
    async fn deliveries(&self) -> Result<Vec<(NaiveDate, PathBuf)>, AdapterError> {
        let dir = self.dir();
        let prefix = tpia_file_prefix(self.config.jurisdiction_name());
        let mut found = Vec::new();
        if !tokio::fs::try_exists(dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))?
        {
            return Ok(found);
        }
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(date) = delivery_date(name, &prefix) {
                found.push((date, entry.path()));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Writes the request template unless one already exists.
    async fn write_request_template_if_missing(
        &self,
        today: NaiveDate,
    ) -> Result<PathBuf, AdapterError> {
        let dir = self.dir();
        let jurisdiction = self.config.jurisdiction_name();
        let path = request_template_path(dir, jurisdiction);
        if tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(path);
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let rendered = render_request(jurisdiction, today, &tpia_file_prefix(jurisdiction));
        tokio::fs::write(&path, rendered)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

#[async_trait]
impl SourceAdapter for TpiaAdapter {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
        _since: DateTime<Utc>,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let deliveries = self.deliveries().await?;
        if deliveries.is_empty() {
            let path = self
                .write_request_template_if_missing(ctx.started_at.date_naive())
                .await?;
            warn!(
                template = %path.display(),
                "no manual deliveries found; request template written"
            );
            return Ok(Vec::new());
        }

        let mut pages = Vec::with_capacity(deliveries.len());
        for (date, path) in deliveries {
            ctx.check(pages.len())?;
            let body = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let row_count = count_csv_rows(&body);
            info!(file = %path.display(), row_count, "manual delivery");
            pages.push(FetchedPage {
                url: format!("file://{}", path.display()),
                content_type: "text/csv".to_string(),
                body,
                fetched_at: Utc::now(),
                partition: Some(date.to_string()),
                row_count,
            });
        }
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

    fn adapter(dir: &Path) -> TpiaAdapter {
        let mut config = SourceConfig::new(
            "travis_county_tpia",
            SourceKind::Tpia,
            dir.to_string_lossy().to_string(),
        );
        config.jurisdiction = Some("Travis County".into());
        TpiaAdapter::new(config, GeoBounds::default())
    }

    fn ctx() -> AdapterContext {
        AdapterContext::new(Utc::now(), CancellationToken::new())
    }

    #[test]
    fn file_names_follow_convention() {
        let prefix = tpia_file_prefix("Travis County");
        assert_eq!(prefix, "travis_county_permits_");
        assert_eq!(
            delivery_date("travis_county_permits_2025-01-15.csv", &prefix),
            NaiveDate::from_ymd_opt(2025, 1, 15)
        );
        assert_eq!(delivery_date("travis_county_permits_latest.csv", &prefix), None);
        assert_eq!(delivery_date("hays_permits_2025-01-15.csv", &prefix), None);
    }

    #[tokio::test]
    async fn empty_directory_writes_request_template() {
        let tmp = tempfile::tempdir().unwrap();
        let drop_dir = tmp.path().join("tpia");
        let adapter = adapter(&drop_dir);
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

        let pages = adapter.fetch(&http, &ctx(), Utc::now()).await.unwrap();
        assert!(pages.is_empty());

        let template = request_template_path(&drop_dir, "Travis County");
        let text = std::fs::read_to_string(&template).unwrap();
        assert!(text.contains("Travis County"));
        assert!(text.contains("travis_county_permits_YYYY-MM-DD.csv"));

        std::fs::write(&template, "edited by hand").unwrap();
        adapter.fetch(&http, &ctx(), Utc::now()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&template).unwrap(), "edited by hand");
    }

    #[tokio::test]
    async fn deliveries_are_read_oldest_first() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("travis_county_permits_2025-02-01.csv"),
            "Permit Number,Status\nTC-3,Issued\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("travis_county_permits_2025-01-01.csv"),
            "permit_number,status\nTC-1,Final\nTC-2,Issued\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignore me").unwrap();

        let adapter = adapter(tmp.path());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let pages = adapter.fetch(&http, &ctx(), Utc::now()).await.unwrap();

        let partitions: Vec<_> = pages.iter().filter_map(|p| p.partition.clone()).collect();
        assert_eq!(partitions, vec!["2025-01-01", "2025-02-01"]);
        assert_eq!(pages[0].row_count, 2);
        let records = adapter.parse(&pages[0]).records;
        let first = adapter.normalize(&records[0], Utc::now()).unwrap().record;
        assert_eq!(first.permit_id, "TC-1");
        assert_eq!(first.jurisdiction, "Travis County");
    }
}
