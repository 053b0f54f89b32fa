//! Filing sources: the contract the pipeline scrapes through, the public
//! court-listing implementation, and a fixture-backed source for tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use ncf_core::{normalize_label, RawRecord};
use scraper::{ElementRef, Html, Node, Selector};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "ncf-scrape";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("selector: {0}")]
    Selector(String),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Anything that can produce raw filing records for a window of dates.
/// The pipeline consumes this contract only; any failure here aborts the
/// run before a single archive write.
#[async_trait]
pub trait FilingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_window(&self, window: &[NaiveDate]) -> Result<Vec<RawRecord>, ScrapeError>;
}

/// Rolling scrape window: `today` and the previous `days - 1` days, newest
/// first. Filings show up on the site with a lag of a few days, so a
/// single-day scrape would miss late postings.
pub fn rolling_window(today: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (0..days.max(1) as i64)
        .map(|offset| today - chrono::Duration::days(offset))
        .collect()
}

fn selector(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|err| ScrapeError::Selector(err.to_string()))
}

fn site_origin(base_url: &str) -> Result<String, ScrapeError> {
    let url = reqwest::Url::parse(base_url).map_err(|err| ScrapeError::InvalidUrl {
        url: base_url.to_string(),
        reason: err.to_string(),
    })?;
    Ok(url.origin().ascii_serialization())
}

/// Label/value pairs inside one listing paragraph. Labels are the
/// `<strong>` tags, values are the text nodes between them, paired in
/// document order. A paragraph with more values than labels (an address
/// split across `<br>` lines) keeps the first value per label.
fn panel_fields(paragraph: ElementRef<'_>) -> Vec<(String, String)> {
    let mut labels: Vec<String> = Vec::new();
    let mut values: Vec<String> = Vec::new();
    for child in paragraph.children() {
        match child.value() {
            Node::Element(element) => {
                let name = element.name();
                if name == "br" {
                    continue;
                }
                let text = ElementRef::wrap(child)
                    .map(|el| el.text().collect::<String>())
                    .unwrap_or_default();
                let text = text.trim();
                if name == "strong" {
                    labels.push(text.trim_matches(':').trim().to_string());
                } else if !text.is_empty() {
                    values.push(text.to_string());
                }
            }
            Node::Text(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    values.push(trimmed.to_string());
                }
            }
            _ => {}
        }
    }
    labels.into_iter().zip(values).collect()
}

/// Parse one listing page into raw records. Each `.panel-body .row` is one
/// filing; field labels are normalized to snake_case column names. Values
/// stay raw here, so the literal `"None"` marker survives until table
/// construction normalizes it away.
pub fn parse_listing(html: &str) -> Result<Vec<RawRecord>, ScrapeError> {
    let document = Html::parse_document(html);
    let row_selector = selector(".panel-body .row")?;
    let paragraph_selector = selector(".col-md-4 p")?;

    let mut records = Vec::new();
    for row in document.select(&row_selector) {
        let mut record = RawRecord::new();
        for paragraph in row.select(&paragraph_selector) {
            for (label, value) in panel_fields(paragraph) {
                record.insert(normalize_label(&label), value);
            }
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}

/// Result page URLs named by the pagination block of a search page,
/// resolved against the site origin, order-preserving deduped. A page
/// without a pagination block is its own single page.
pub fn page_urls(origin: &str, search_url: &str, html: &str) -> Result<Vec<String>, ScrapeError> {
    let document = Html::parse_document(html);
    let link_selector = selector(".pagination li a")?;

    let mut urls: Vec<String> = Vec::new();
    for link in document.select(&link_selector) {
        if let Some(href) = link.value().attr("href") {
            let url = if href.starts_with("http://") || href.starts_with("https://") {
                href.to_string()
            } else {
                format!("{}/{}", origin.trim_end_matches('/'), href.trim_start_matches('/'))
            };
            if !urls.iter().any(|existing| existing == &url) {
                urls.push(url);
            }
        }
    }
    if urls.is_empty() {
        urls.push(search_url.to_string());
    }
    Ok(urls)
}

/// Scraper for the public new-criminal-filings listing. Each window date
/// gets one search request; the pagination block fans out to the rest of
/// that date's pages.
pub struct CourtsSource {
    client: reqwest::Client,
    base_url: String,
}

impl CourtsSource {
    pub fn new(
        base_url: impl Into<String>,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn search_url(&self, date: NaiveDate) -> String {
        format!("{}?search={}", self.base_url, date.format("%Y-%m-%d"))
    }

    async fn fetch_page(&self, url: &str) -> Result<String, ScrapeError> {
        debug!(url, "fetching listing page");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl FilingSource for CourtsSource {
    fn source_id(&self) -> &'static str {
        "courts-listing"
    }

    async fn fetch_window(&self, window: &[NaiveDate]) -> Result<Vec<RawRecord>, ScrapeError> {
        let origin = site_origin(&self.base_url)?;
        let mut records = Vec::new();
        for &date in window {
            let search_url = self.search_url(date);
            let first_page = self.fetch_page(&search_url).await?;
            let pages = page_urls(&origin, &search_url, &first_page)?;

            let mut date_records = Vec::new();
            if pages.len() == 1 && pages[0] == search_url {
                date_records.extend(parse_listing(&first_page)?);
            } else {
                for url in &pages {
                    let html = self.fetch_page(url).await?;
                    date_records.extend(parse_listing(&html)?);
                }
            }
            // A date with no filings is a quiet court day, not a failure.
            info!(
                date = %date,
                pages = pages.len(),
                records = date_records.len(),
                "scraped listing date"
            );
            records.extend(date_records);
        }
        Ok(records)
    }
}

/// Fixed in-memory source for tests and offline runs.
pub struct FixtureSource {
    records: Vec<RawRecord>,
}

impl FixtureSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl FilingSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_window(&self, _window: &[NaiveDate]) -> Result<Vec<RawRecord>, ScrapeError> {
        Ok(self.records.clone())
    }
}
