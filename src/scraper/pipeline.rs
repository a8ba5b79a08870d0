//! Deadline-bounded fallback across scrape engines

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use url::Url;

use super::document::{Document, DocumentMetadata, PageOptions};
use super::engine::{order_candidates, EngineKind, EngineResponse, SharedEngine};
use super::engines::build_engines;
use super::error::ScrapeError;
use super::html::{extract_links, extract_metadata, html_to_markdown, transform_html};
use super::pdf::{is_pdf_url, PdfExtractor};
use super::ScraperConfig;
use crate::metrics;

/// Statuses that end the fallback chain
const TERMINAL_STATUSES: [u16; 2] = [404, 500];

/// How a scrape ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// An engine produced enough content or a screenshot
    Accepted,
    /// The page answered 404 or 500
    TerminalPage,
    /// Every candidate was tried without an acceptable result
    Exhausted,
    /// The budget ran out first
    DeadlineExceeded,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "accepted",
            Verdict::TerminalPage => "terminal_page",
            Verdict::Exhausted => "exhausted",
            Verdict::DeadlineExceeded => "deadline_exceeded",
        }
    }

    /// Whether the job that ran this scrape succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Accepted | Verdict::TerminalPage)
    }
}

/// Document plus the verdict that produced it
#[derive(Debug, Clone)]
pub struct ScrapeReport {
    pub document: Document,
    pub verdict: Verdict,
}

impl ScrapeReport {
    fn new(document: Document, verdict: Verdict) -> Self {
        Self { document, verdict }
    }

    /// Why the job that ran this scrape failed, if it did
    pub fn failure_reason(&self) -> Option<String> {
        if self.verdict.is_success() {
            return None;
        }
        Some(
            self.document
                .metadata
                .error
                .clone()
                .unwrap_or_else(|| format!("scrape {}", self.verdict.as_str())),
        )
    }
}

/// Ordered fallback over the configured engines
pub struct ScrapePipeline {
    engines: Vec<SharedEngine>,
    host_overrides: HashMap<String, Vec<EngineKind>>,
    pdf: PdfExtractor,
    deadline: Duration,
    attempt_timeout: Duration,
    min_content_length: usize,
}

impl ScrapePipeline {
    /// Build a pipeline over explicit engines
    pub fn new(engines: Vec<SharedEngine>, config: &ScraperConfig) -> Result<Self, ScrapeError> {
        Ok(Self {
            engines,
            host_overrides: config.host_overrides.clone(),
            pdf: PdfExtractor::new(config.deadline())?,
            deadline: config.deadline(),
            attempt_timeout: config.attempt_timeout(),
            min_content_length: config.min_content_length,
        })
    }

    /// Build a pipeline over every available engine
    pub fn from_config(config: &ScraperConfig) -> Result<Self, ScrapeError> {
        Self::new(build_engines(config)?, config)
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Budget for one page, honoring a per-page override
    pub fn budget_for(&self, options: &PageOptions) -> Duration {
        options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.deadline)
    }

    /// Scrape `url` within the budget from [`budget_for`](Self::budget_for)
    pub async fn scrape(&self, url: &str, options: &PageOptions) -> ScrapeReport {
        let deadline = Instant::now() + self.budget_for(options);
        self.scrape_until(url, options, deadline).await
    }

    /// Scrape `url`, never running past `deadline`
    pub async fn scrape_until(
        &self,
        url: &str,
        options: &PageOptions,
        deadline: Instant,
    ) -> ScrapeReport {
        let started = Instant::now();
        let budget = deadline.saturating_duration_since(started);
        let report = self.run(url, options, deadline, budget).await;

        metrics::record_scrape(report.verdict.as_str(), started.elapsed().as_secs_f64());
        info!(
            url = %url,
            verdict = report.verdict.as_str(),
            status = report.document.metadata.status_code,
            engine = report.document.metadata.engine.as_deref().unwrap_or("-"),
            elapsed_ms = crate::utils::millis(started.elapsed()),
            "Scrape finished"
        );
        report
    }

    async fn run(
        &self,
        url: &str,
        options: &PageOptions,
        deadline: Instant,
        budget: Duration,
    ) -> ScrapeReport {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                let error = ScrapeError::invalid_url(url, e);
                return ScrapeReport::new(
                    Document::failed(url, 0, error.to_string()),
                    Verdict::Exhausted,
                );
            }
        };

        if is_pdf_url(url) {
            return self.scrape_pdf(url, deadline, budget).await;
        }

        let candidates = order_candidates(
            &self.engines,
            parsed.host_str(),
            options.required_features(),
            &self.host_overrides,
        );
        if candidates.is_empty() {
            return ScrapeReport::new(
                Document::failed(url, 0, ScrapeError::NoEngines.to_string()),
                Verdict::Exhausted,
            );
        }

        let mut best: Option<Document> = None;
        let mut last_error: Option<String> = None;

        for engine in candidates {
            let kind = engine.kind();
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let attempt_deadline = deadline.min(now + self.attempt_timeout);

            let response = match timeout_at(
                attempt_deadline,
                engine.scrape(url, options, attempt_deadline - now),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    metrics::record_engine_attempt(kind.as_str(), "error");
                    debug!(url = %url, engine = %kind, error = %e, "Engine attempt failed");
                    last_error = Some(e.to_string());
                    continue;
                }
                Err(_) => {
                    metrics::record_engine_attempt(kind.as_str(), "timeout");
                    debug!(url = %url, engine = %kind, "Engine attempt timed out");
                    last_error = Some(format!("{kind} timed out"));
                    continue;
                }
            };

            if response.is_pdf() {
                metrics::record_engine_attempt(kind.as_str(), "pdf");
                return self.scrape_pdf(url, deadline, budget).await;
            }

            let status = response.status_code;
            let document = build_document(url, kind, response, options);

            if TERMINAL_STATUSES.contains(&status) {
                metrics::record_engine_attempt(kind.as_str(), "terminal");
                return ScrapeReport::new(document, Verdict::TerminalPage);
            }

            if document.content_len() >= self.min_content_length || document.screenshot.is_some()
            {
                metrics::record_engine_attempt(kind.as_str(), "accepted");
                return ScrapeReport::new(document, Verdict::Accepted);
            }

            metrics::record_engine_attempt(kind.as_str(), "insufficient");
            debug!(
                url = %url,
                engine = %kind,
                status,
                content_len = document.content_len(),
                "Response not usable, trying next engine"
            );
            last_error = Some(format!(
                "{kind} returned status {status} with {} characters",
                document.content_len()
            ));
            if best
                .as_ref()
                .map_or(true, |b| document.content_len() > b.content_len())
            {
                best = Some(document);
            }
        }

        let verdict = if Instant::now() >= deadline {
            Verdict::DeadlineExceeded
        } else {
            Verdict::Exhausted
        };
        let error = match verdict {
            Verdict::DeadlineExceeded => ScrapeError::DeadlineExceeded { budget }.to_string(),
            _ => last_error.unwrap_or_else(|| "all scrape engines failed".to_string()),
        };

        warn!(url = %url, verdict = verdict.as_str(), error = %error, "No engine produced usable content");
        let document = match best {
            Some(mut document) => {
                document.metadata.error.get_or_insert(error);
                document
            }
            None => Document::failed(url, 0, error),
        };
        ScrapeReport::new(document, verdict)
    }

    async fn scrape_pdf(&self, url: &str, deadline: Instant, budget: Duration) -> ScrapeReport {
        match timeout_at(deadline, self.pdf.extract(url)).await {
            Ok(Ok(pdf)) => {
                let document = Document {
                    markdown: Some(pdf.text),
                    metadata: DocumentMetadata {
                        source_url: url.to_string(),
                        url: Some(url.to_string()),
                        status_code: pdf.status_code,
                        content_type: Some("application/pdf".to_string()),
                        engine: Some("pdf".to_string()),
                        num_pages: Some(pdf.num_pages),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                ScrapeReport::new(document, Verdict::Accepted)
            }
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "PDF extraction failed");
                ScrapeReport::new(Document::failed(url, 0, e.to_string()), Verdict::Exhausted)
            }
            Err(_) => {
                let error = ScrapeError::DeadlineExceeded { budget };
                ScrapeReport::new(
                    Document::failed(url, 0, error.to_string()),
                    Verdict::DeadlineExceeded,
                )
            }
        }
    }
}

/// Turn a raw engine response into a [`Document`]
fn build_document(
    source_url: &str,
    engine: EngineKind,
    response: EngineResponse,
    options: &PageOptions,
) -> Document {
    let final_url = if response.url.is_empty() {
        source_url.to_string()
    } else {
        response.url
    };

    let mut metadata = DocumentMetadata {
        source_url: source_url.to_string(),
        url: Some(final_url.clone()),
        status_code: response.status_code,
        error: response.page_error,
        content_type: response.content_type,
        engine: Some(engine.as_str().to_string()),
        ..Default::default()
    };
    extract_metadata(&response.content, &mut metadata);

    if metadata.error.is_none() && TERMINAL_STATUSES.contains(&response.status_code) {
        metadata.error = Some(ScrapeError::TerminalPage {
            status: response.status_code,
        }
        .to_string());
    }

    let cleaned = transform_html(&response.content, options);
    let markdown = html_to_markdown(&cleaned);
    let links = extract_links(&response.content, &final_url);

    Document {
        markdown: Some(markdown),
        html: Some(cleaned),
        raw_html: Some(response.content),
        links,
        screenshot: response.screenshot,
        metadata,
    }
}
