#![forbid(unsafe_code)]

//! Fetches a web page, pulls the readable content out of it and stores the
//! result as JSON or plain text.

mod fetch;
mod output;
mod parser;

use std::{path::PathBuf, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{error, info};

pub use fetch::{Fetcher, is_valid_url, random_delay, random_headers};
pub use output::{FileInfo, OutputFormat, OutputStore, file_info, generate_filename};
pub use parser::{ContentParser, PageMetadata, ScrapedPage, Section, clean_text};

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Too many redirects")]
    TooManyRedirects,
    #[error("Request failed after {attempts} attempts: {reason}")]
    Fetch { attempts: u32, reason: String },
    #[error("Error saving file: {0:#}")]
    Output(anyhow::Error),
    #[error("scrape task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub url: String,
    pub filepath: PathBuf,
    pub file_info: FileInfo,
    pub page: ScrapedPage,
}

#[derive(Clone)]
pub struct WebScraper {
    fetcher: Fetcher,
    parser: Arc<ContentParser>,
    store: OutputStore,
}

impl WebScraper {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        delay: Duration,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: Fetcher::new(delay, max_retries),
            parser: Arc::new(ContentParser::new()?),
            store: OutputStore::new(output_dir),
        })
    }

    pub fn output_dir(&self) -> &std::path::Path {
        self.store.dir()
    }

    pub async fn fetch_url(&self, url: &str) -> Result<String, ScrapeError> {
        let fetcher = self.fetcher.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || fetcher.fetch(&url)).await?
    }

    /// Fetch, parse and save a single page.
    pub async fn scrape(
        &self,
        url: &str,
        format: OutputFormat,
    ) -> Result<ScrapeOutcome, ScrapeError> {
        let result = self.scrape_inner(url, format).await;
        match &result {
            Ok(outcome) => info!(url, path = %outcome.filepath.display(), "scraped page"),
            Err(err) => error!(url, error = %err, "scraping failed"),
        }
        result
    }

    async fn scrape_inner(
        &self,
        url: &str,
        format: OutputFormat,
    ) -> Result<ScrapeOutcome, ScrapeError> {
        let html = self.fetch_url(url).await?;
        let parser = self.parser.clone();
        let store = self.store.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            let page = parser.parse_html(&html, &url);
            let filepath = store.save(&page, format).map_err(ScrapeError::Output)?;
            let file_info = file_info(&filepath).map_err(ScrapeError::Output)?;
            Ok(ScrapeOutcome {
                url,
                filepath,
                file_info,
                page,
            })
        })
        .await?
    }

    /// Scrapes every URL in order, pausing between requests. One failure
    /// never aborts the batch.
    pub async fn scrape_multiple(
        &self,
        urls: &[String],
        format: OutputFormat,
    ) -> Vec<Result<ScrapeOutcome, ScrapeError>> {
        let mut results = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            results.push(self.scrape(url, format).await);
            if index + 1 < urls.len() {
                tokio::time::sleep(random_delay(self.fetcher.delay())).await;
            }
        }
        results
    }
}
