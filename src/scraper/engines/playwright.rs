//! Client for an external playwright rendering service

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::scraper::document::PageOptions;
use crate::scraper::engine::{EngineKind, EngineResponse, Feature, FeatureSet, ScrapeEngine};
use crate::scraper::error::ScrapeError;

#[derive(Debug, Serialize)]
struct PlaywrightRequest<'a> {
    url: &'a str,
    wait_after_load: u64,
    timeout: u64,
    headers: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaywrightResponse {
    #[serde(default)]
    content: String,
    page_status_code: Option<u16>,
    page_error: Option<String>,
}

/// Renders pages through `POST {base_url}/html`
pub struct PlaywrightEngine {
    client: Client,
    endpoint: String,
}

impl PlaywrightEngine {
    pub fn new(base_url: &str) -> Result<Self, ScrapeError> {
        Ok(Self {
            client: Client::builder().build()?,
            endpoint: format!("{}/html", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ScrapeEngine for PlaywrightEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Playwright
    }

    fn features(&self) -> FeatureSet {
        FeatureSet::of(&[Feature::WaitFor, Feature::Headers])
    }

    async fn scrape(
        &self,
        url: &str,
        options: &PageOptions,
        timeout: Duration,
    ) -> Result<EngineResponse, ScrapeError> {
        let request = PlaywrightRequest {
            url,
            wait_after_load: options.wait_for_ms,
            timeout: timeout.as_millis() as u64,
            headers: &options.headers,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ScrapeError::transient("playwright", e))?;

        if !response.status().is_success() {
            return Err(ScrapeError::transient(
                "playwright",
                format!("service returned {}", response.status()),
            ));
        }

        let body: PlaywrightResponse = response
            .json()
            .await
            .map_err(|e| ScrapeError::transient("playwright", e))?;

        Ok(EngineResponse {
            url: url.to_string(),
            status_code: body.page_status_code.unwrap_or(200),
            content: body.content,
            content_type: Some("text/html".to_string()),
            screenshot: None,
            page_error: body.page_error,
        })
    }
}
