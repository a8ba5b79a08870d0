//! Scrape inputs and outputs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::engine::{Feature, FeatureSet};

// ============================================================================
// Page options
// ============================================================================

/// Direction for [`Action::Scroll`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
}

/// Scripted browser step run before the page is captured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        milliseconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
    Click {
        selector: String,
    },
    Write {
        text: String,
    },
    Press {
        key: String,
    },
    Scroll {
        #[serde(default)]
        direction: ScrollDirection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
    Screenshot {
        #[serde(default)]
        full_page: bool,
    },
    ExecuteJavascript {
        script: String,
    },
}

/// Per-scrape options carried on scrape jobs and stored crawls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageOptions {
    /// Extra wait after load, in milliseconds
    pub wait_for_ms: u64,

    pub screenshot: bool,

    pub full_page_screenshot: bool,

    /// Request header overrides
    pub headers: BTreeMap<String, String>,

    /// Strip navigation, footers, ads and similar chrome
    pub only_main_content: bool,

    /// CSS selectors; when non-empty only matching subtrees are kept
    pub include_tags: Vec<String>,

    /// CSS selectors removed from the page
    pub exclude_tags: Vec<String>,

    pub actions: Vec<Action>,

    /// Overall budget override for this page
    pub timeout_ms: Option<u64>,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            wait_for_ms: 0,
            screenshot: false,
            full_page_screenshot: false,
            headers: BTreeMap::new(),
            only_main_content: true,
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            actions: Vec::new(),
            timeout_ms: None,
        }
    }
}

impl PageOptions {
    /// Engine capabilities these options depend on
    pub fn required_features(&self) -> FeatureSet {
        let mut features = FeatureSet::EMPTY;
        if !self.actions.is_empty() {
            features = features.with(Feature::Actions);
        }
        if self.screenshot || self.full_page_screenshot {
            features = features.with(Feature::Screenshot);
        }
        if self.wait_for_ms > 0 {
            features = features.with(Feature::WaitFor);
        }
        if !self.headers.is_empty() {
            features = features.with(Feature::Headers);
        }
        features
    }

    pub fn wants_screenshot(&self) -> bool {
        self.screenshot || self.full_page_screenshot
    }
}

// ============================================================================
// Document
// ============================================================================

/// Page metadata gathered from the response and the HTML head
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// URL that was requested
    pub source_url: String,

    /// Final URL after redirects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub status_code: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Engine that produced the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robots: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub og_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub og_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub og_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub og_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub og_audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub og_determiner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub og_locale: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub og_locale_alternate: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub og_site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub og_video: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,

    /// Page count for PDF documents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_pages: Option<u32>,
}

/// Normalized result of one scrape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,

    /// Cleaned HTML
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_html: Option<String>,

    /// Absolute outbound links
    #[serde(default)]
    pub links: Vec<String>,

    /// Base64 image or a URL, depending on the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,

    pub metadata: DocumentMetadata,
}

impl Document {
    /// An empty document recording why nothing was produced
    pub fn failed(source_url: impl Into<String>, status_code: u16, error: impl Into<String>) -> Self {
        Self {
            metadata: DocumentMetadata {
                source_url: source_url.into(),
                status_code,
                error: Some(error.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Final URL, falling back to the requested one
    pub fn final_url(&self) -> &str {
        self.metadata
            .url
            .as_deref()
            .unwrap_or(&self.metadata.source_url)
    }

    pub fn content_len(&self) -> usize {
        self.markdown.as_ref().map_or(0, |m| m.trim().chars().count())
    }
}
