//! Concrete scrape engines

pub mod browser;
pub mod fetch;
pub mod playwright;

use std::sync::Arc;

pub use browser::BrowserEngine;
pub use fetch::FetchEngine;
pub use playwright::PlaywrightEngine;

use super::engine::{EngineKind, SharedEngine};
use super::error::ScrapeError;
use super::ScraperConfig;

fn configured(url: &Option<String>) -> Option<&str> {
    url.as_deref().map(str::trim).filter(|u| !u.is_empty())
}

/// Whether the configuration carries what `kind` needs to run
pub fn is_available(kind: EngineKind, config: &ScraperConfig) -> bool {
    match kind {
        EngineKind::Fetch => true,
        EngineKind::Playwright => configured(&config.playwright_url).is_some(),
        EngineKind::Browser => configured(&config.browser_url).is_some(),
    }
}

/// Instantiate every available engine in configured order
pub fn build_engines(config: &ScraperConfig) -> Result<Vec<SharedEngine>, ScrapeError> {
    let mut engines: Vec<SharedEngine> = Vec::new();

    for kind in &config.engines {
        if !is_available(*kind, config) {
            tracing::debug!(engine = %kind, "Engine not configured, skipping");
            continue;
        }
        if engines.iter().any(|e| e.kind() == *kind) {
            continue;
        }

        let engine: SharedEngine = match kind {
            EngineKind::Fetch => Arc::new(FetchEngine::new(config.requests_per_second)?),
            EngineKind::Playwright => Arc::new(PlaywrightEngine::new(
                configured(&config.playwright_url).unwrap_or_default(),
            )?),
            EngineKind::Browser => Arc::new(BrowserEngine::new(
                configured(&config.browser_url).unwrap_or_default(),
            )?),
        };
        engines.push(engine);
    }

    tracing::info!(
        engines = ?engines.iter().map(|e| e.kind().as_str()).collect::<Vec<_>>(),
        "Scrape engines ready"
    );
    Ok(engines)
}
