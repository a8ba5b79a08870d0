//! Link filtering for crawl discovery
//!
//! Every candidate link is resolved against the crawl origin and then run
//! through a fixed sequence of checks. The first failing check becomes the
//! link's [`DenialReason`]; links passing every check are kept in discovery
//! order with duplicates collapsed.

use std::collections::HashSet;
use std::fmt;

use regex::Regex;
use serde::Serialize;
use url::Url;

use super::error::CrawlError;
use super::CrawlerOptions;
use crate::metrics;

/// Asset extensions never worth scraping
const DENIED_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".ico", ".svg", ".tiff", ".zip", ".exe", ".dmg", ".mp4", ".mp3", ".wav",
    ".pptx", ".xlsx", ".avi", ".flv", ".woff", ".ttf", ".woff2", ".webp", ".inc", ".png",
    ".jpg", ".jpeg", ".gif",
];

/// Why a discovered link was not followed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    UrlParseError,
    ExternalLink,
    DepthLimit,
    ExcludePattern,
    IncludePattern,
    BackwardCrawling,
    FileType,
    DiscoveryDepth,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::UrlParseError => "url_parse_error",
            DenialReason::ExternalLink => "external_link",
            DenialReason::DepthLimit => "depth_limit",
            DenialReason::ExcludePattern => "exclude_pattern",
            DenialReason::IncludePattern => "include_pattern",
            DenialReason::BackwardCrawling => "backward_crawling",
            DenialReason::FileType => "file_type",
            DenialReason::DiscoveryDepth => "discovery_depth",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Links kept plus the reason each rejected link was dropped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutcome {
    pub links: Vec<String>,
    pub denials: Vec<(String, DenialReason)>,
}

impl FilterOutcome {
    pub fn denial_for(&self, link: &str) -> Option<DenialReason> {
        self.denials
            .iter()
            .find(|(l, _)| l == link)
            .map(|(_, reason)| *reason)
    }
}

/// Compiled discovery rules for one crawl
#[derive(Debug, Clone)]
pub struct LinkFilter {
    origin: Url,
    origin_depth: u32,
    max_depth: u32,
    max_discovery_depth: Option<u32>,
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
    regex_on_full_url: bool,
    allow_backward_links: bool,
    allow_external_links: bool,
    allow_subdomains: bool,
    ignore_query_parameters: bool,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, CrawlError> {
    patterns
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| Regex::new(p).map_err(CrawlError::from))
        .collect()
}

/// Number of path segments, not counting index files
fn url_depth(path: &str) -> u32 {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != "index.php" && *s != "index.html")
        .count() as u32
}

/// `path` is `base` itself or lies below it, compared segment by segment
fn is_within_path(path: &str, base: &str) -> bool {
    match path.strip_prefix(base) {
        Some(rest) => base.ends_with('/') || rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

fn is_file(url: &Url) -> bool {
    let path = url.path().to_lowercase();
    DENIED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

impl LinkFilter {
    /// Compile the filter for links discovered under `origin`
    pub fn new(origin: &str, options: &CrawlerOptions) -> Result<Self, CrawlError> {
        let origin = Url::parse(origin).map_err(|e| CrawlError::invalid_url(origin, e))?;
        Ok(Self {
            origin_depth: url_depth(origin.path()),
            origin,
            max_depth: options.max_depth,
            max_discovery_depth: options.max_discovery_depth,
            includes: compile(&options.include_paths)?,
            excludes: compile(&options.exclude_paths)?,
            regex_on_full_url: options.regex_on_full_url,
            allow_backward_links: options.allow_backward_links,
            allow_external_links: options.allow_external_links,
            allow_subdomains: options.allow_subdomains,
            ignore_query_parameters: options.ignore_query_parameters,
        })
    }

    fn is_external(&self, url: &Url) -> bool {
        let (Some(host), Some(origin)) = (url.host_str(), self.origin.host_str()) else {
            return true;
        };
        let host = strip_www(host);
        let origin = strip_www(origin);
        if host == origin {
            return false;
        }
        !(self.allow_subdomains && host.ends_with(&format!(".{origin}")))
    }

    /// Check one absolute link
    pub fn check(&self, url: &Url, discovery_depth: u32) -> Result<(), DenialReason> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DenialReason::UrlParseError);
        }

        if !self.allow_external_links && self.is_external(url) {
            return Err(DenialReason::ExternalLink);
        }

        if url_depth(url.path()) > self.max_depth.saturating_add(self.origin_depth) {
            return Err(DenialReason::DepthLimit);
        }

        let target = if self.regex_on_full_url {
            url.as_str()
        } else {
            url.path()
        };

        if self.excludes.iter().any(|re| re.is_match(target)) {
            return Err(DenialReason::ExcludePattern);
        }

        if !self.includes.is_empty() && !self.includes.iter().any(|re| re.is_match(target)) {
            return Err(DenialReason::IncludePattern);
        }

        if !self.allow_backward_links && !is_within_path(url.path(), self.origin.path()) {
            return Err(DenialReason::BackwardCrawling);
        }

        if is_file(url) {
            return Err(DenialReason::FileType);
        }

        if let Some(max) = self.max_discovery_depth {
            if discovery_depth > max {
                return Err(DenialReason::DiscoveryDepth);
            }
        }

        Ok(())
    }

    /// Filter a batch of links found `discovery_depth` hops from the seed
    ///
    /// Relative links resolve against the origin; kept links are absolute and
    /// fragment-free.
    pub fn filter<I, S>(&self, links: I, discovery_depth: u32) -> FilterOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outcome = FilterOutcome::default();
        let mut seen = HashSet::new();

        for link in links {
            let link = link.as_ref();
            let mut url = match self.origin.join(link) {
                Ok(url) => url,
                Err(_) => {
                    metrics::record_link_filtered(DenialReason::UrlParseError.as_str());
                    outcome
                        .denials
                        .push((link.to_string(), DenialReason::UrlParseError));
                    continue;
                }
            };
            url.set_fragment(None);
            if self.ignore_query_parameters {
                url.set_query(None);
            }

            if !seen.insert(url.to_string()) {
                continue;
            }

            match self.check(&url, discovery_depth) {
                Ok(()) => outcome.links.push(url.into()),
                Err(reason) => {
                    metrics::record_link_filtered(reason.as_str());
                    outcome.denials.push((link.to_string(), reason));
                }
            }
        }

        outcome
    }
}
