//! Client for a full browser automation service (actions, screenshots)

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::scraper::document::{Action, PageOptions};
use crate::scraper::engine::{EngineKind, EngineResponse, Feature, FeatureSet, ScrapeEngine};
use crate::scraper::error::ScrapeError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BrowserRequest<'a> {
    url: &'a str,
    wait: u64,
    timeout: u64,
    headers: &'a BTreeMap<String, String>,
    actions: &'a [Action],
    screenshot: bool,
    full_page_screenshot: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowserResponse {
    #[serde(default)]
    content: String,
    page_status_code: Option<u16>,
    page_error: Option<String>,
    screenshot: Option<String>,
    url: Option<String>,
    content_type: Option<String>,
}

/// Drives pages through `POST {base_url}/scrape`
pub struct BrowserEngine {
    client: Client,
    endpoint: String,
}

impl BrowserEngine {
    pub fn new(base_url: &str) -> Result<Self, ScrapeError> {
        Ok(Self {
            client: Client::builder().build()?,
            endpoint: format!("{}/scrape", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ScrapeEngine for BrowserEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Browser
    }

    fn features(&self) -> FeatureSet {
        FeatureSet::of(&Feature::ALL)
    }

    async fn scrape(
        &self,
        url: &str,
        options: &PageOptions,
        timeout: Duration,
    ) -> Result<EngineResponse, ScrapeError> {
        let request = BrowserRequest {
            url,
            wait: options.wait_for_ms,
            timeout: timeout.as_millis() as u64,
            headers: &options.headers,
            actions: &options.actions,
            screenshot: options.screenshot,
            full_page_screenshot: options.full_page_screenshot,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ScrapeError::transient("browser", e))?;

        if !response.status().is_success() {
            return Err(ScrapeError::transient(
                "browser",
                format!("service returned {}", response.status()),
            ));
        }

        let body: BrowserResponse = response
            .json()
            .await
            .map_err(|e| ScrapeError::transient("browser", e))?;

        Ok(EngineResponse {
            url: body.url.unwrap_or_else(|| url.to_string()),
            status_code: body.page_status_code.unwrap_or(200),
            content: body.content,
            content_type: body.content_type.or_else(|| Some("text/html".to_string())),
            screenshot: body.screenshot,
            page_error: body.page_error,
        })
    }
}
