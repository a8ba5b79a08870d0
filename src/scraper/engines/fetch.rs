//! Plain HTTP engine with rate limiting and charset detection
//!
//! Features:
//! - User-Agent rotation
//! - Rate limiting with governor
//! - Charset detection from the Content-Type header or an HTML meta tag
//! - Request header overrides

use std::num::NonZeroU32;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use rand::seq::SliceRandom;
use regex::bytes::Regex;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT},
    Client,
};

use crate::scraper::document::PageOptions;
use crate::scraper::engine::{EngineKind, EngineResponse, Feature, FeatureSet, ScrapeEngine};
use crate::scraper::error::ScrapeError;

/// Pool of realistic User-Agent strings for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

static META_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?\s*([A-Za-z0-9_:.-]+)"#).expect("valid regex")
});

/// Label from a `charset=` parameter in a Content-Type value
fn header_charset(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"'))
}

/// Encoding declared by an HTML meta tag in the first kilobyte
fn meta_charset(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(1024)];
    let label = META_CHARSET.captures(head)?.get(1)?;
    Encoding::for_label(label.as_bytes())
}

/// Decode a response body to a `String`
///
/// This tries, in order:
/// 1. The Content-Type charset
/// 2. A `<meta charset>` declaration
/// 3. Strict UTF-8
/// 4. Windows-1252, which never fails
pub fn decode_bytes(bytes: &[u8], content_type: &str) -> String {
    let declared = header_charset(content_type)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .or_else(|| meta_charset(bytes));

    if let Some(encoding) = declared {
        let (text, _, _) = encoding.decode(bytes);
        return text.into_owned();
    }

    let (text, _, had_errors) = UTF_8.decode(bytes);
    if !had_errors {
        return text.into_owned();
    }

    let (text, _, _) = WINDOWS_1252.decode(bytes);
    text.into_owned()
}

/// Plain reqwest engine
pub struct FetchEngine {
    /// HTTP client with compression and a cookie store
    client: Client,

    /// Rate limiter to control request frequency
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl FetchEngine {
    /// Create an engine limited to `requests_per_second`
    ///
    /// # Errors
    ///
    /// Returns `ScrapeError::Http` if the HTTP client cannot be created
    pub fn new(requests_per_second: u32) -> Result<Self, ScrapeError> {
        let client = Client::builder().gzip(true).cookie_store(true).build()?;

        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            client,
            rate_limiter,
        })
    }

    /// Browser-like headers with caller overrides applied last
    fn build_headers(&self, options: &PageOptions) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        for (name, value) in &options.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::debug!(header = %name, "Ignoring invalid header override"),
            }
        }

        headers
    }
}

/// Get a random user agent from the pool
fn random_user_agent() -> &'static str {
    let mut rng = rand::thread_rng();
    USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0])
}

#[async_trait]
impl ScrapeEngine for FetchEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Fetch
    }

    fn features(&self) -> FeatureSet {
        FeatureSet::of(&[Feature::Headers])
    }

    async fn scrape(
        &self,
        url: &str,
        options: &PageOptions,
        timeout: Duration,
    ) -> Result<EngineResponse, ScrapeError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(url)
            .headers(self.build_headers(options))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ScrapeError::transient("fetch", "request timed out")
                } else {
                    ScrapeError::transient("fetch", e)
                }
            })?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut engine_response = EngineResponse {
            url: final_url,
            status_code,
            content: String::new(),
            content_type,
            screenshot: None,
            page_error: None,
        };

        // PDF bodies are fetched again by the PDF extractor
        if engine_response.is_pdf() {
            return Ok(engine_response);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ScrapeError::transient("fetch", e))?;
        engine_response.content =
            decode_bytes(&bytes, engine_response.content_type.as_deref().unwrap_or(""));

        Ok(engine_response)
    }
}
