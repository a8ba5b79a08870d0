//! Scrape engine capability interface and candidate ordering

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::document::PageOptions;
use super::error::ScrapeError;

// ============================================================================
// Features
// ============================================================================

/// Capability a request may depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Actions,
    Screenshot,
    WaitFor,
    Headers,
}

impl Feature {
    pub const ALL: [Feature; 4] = [
        Feature::Actions,
        Feature::Screenshot,
        Feature::WaitFor,
        Feature::Headers,
    ];

    fn bit(self) -> u8 {
        match self {
            Feature::Actions => 1,
            Feature::Screenshot => 1 << 1,
            Feature::WaitFor => 1 << 2,
            Feature::Headers => 1 << 3,
        }
    }

    /// Features without which the request is meaningless
    pub fn is_hard(self) -> bool {
        matches!(self, Feature::Actions | Feature::Screenshot)
    }
}

/// Small bit set of [`Feature`]s
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet(u8);

impl FeatureSet {
    pub const EMPTY: FeatureSet = FeatureSet(0);

    pub fn of(features: &[Feature]) -> Self {
        features.iter().fold(Self::EMPTY, |set, f| set.with(*f))
    }

    #[must_use]
    pub fn with(self, feature: Feature) -> Self {
        Self(self.0 | feature.bit())
    }

    pub fn contains(self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    pub fn contains_all(self, other: FeatureSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of features in both sets
    pub fn overlap(self, other: FeatureSet) -> u32 {
        (self.0 & other.0).count_ones()
    }

    pub fn iter(self) -> impl Iterator<Item = Feature> {
        Feature::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

// ============================================================================
// Engines
// ============================================================================

/// Backend families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Browser,
    Playwright,
    Fetch,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Browser => "browser",
            EngineKind::Playwright => "playwright",
            EngineKind::Fetch => "fetch",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "browser" => Ok(EngineKind::Browser),
            "playwright" => Ok(EngineKind::Playwright),
            "fetch" => Ok(EngineKind::Fetch),
            other => Err(format!("unknown scrape engine: {other}")),
        }
    }
}

/// Raw answer from one engine attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineResponse {
    /// Final URL after redirects
    pub url: String,
    pub status_code: u16,
    /// Page body (HTML for web pages)
    pub content: String,
    pub content_type: Option<String>,
    pub screenshot: Option<String>,
    /// Error reported by the engine alongside the page
    pub page_error: Option<String>,
}

impl EngineResponse {
    pub fn is_pdf(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/pdf"))
    }
}

/// One scraping backend
#[async_trait]
pub trait ScrapeEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn features(&self) -> FeatureSet;

    /// Fetch `url`; non-2xx pages are responses, not errors
    async fn scrape(
        &self,
        url: &str,
        options: &PageOptions,
        timeout: Duration,
    ) -> Result<EngineResponse, ScrapeError>;
}

pub type SharedEngine = Arc<dyn ScrapeEngine>;

/// Order engines for one request
///
/// Engines named by a per-host override come first in override order. The
/// rest keep their configured order, stably sorted by whether they cover every
/// required feature and then by how many required features they cover.
/// Engines missing a hard feature (actions, screenshots) are dropped.
pub fn order_candidates(
    engines: &[SharedEngine],
    host: Option<&str>,
    required: FeatureSet,
    overrides: &HashMap<String, Vec<EngineKind>>,
) -> Vec<SharedEngine> {
    let hard = required
        .iter()
        .filter(|f| f.is_hard())
        .fold(FeatureSet::EMPTY, FeatureSet::with);

    let preferred: &[EngineKind] = host
        .and_then(|host| {
            overrides
                .get(host)
                .or_else(|| host.strip_prefix("www.").and_then(|bare| overrides.get(bare)))
        })
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut candidates: Vec<SharedEngine> = engines
        .iter()
        .filter(|engine| engine.features().contains_all(hard))
        .cloned()
        .collect();

    candidates.sort_by_key(|engine| {
        let features = engine.features();
        let override_rank = preferred
            .iter()
            .position(|kind| *kind == engine.kind())
            .unwrap_or(usize::MAX);
        (
            override_rank,
            !features.contains_all(required),
            std::cmp::Reverse(features.overlap(required)),
        )
    });

    candidates
}
