//! Sitemap parsing and retrieval
//!
//! Only the two standard roots are understood: `<urlset>` (page URLs) and
//! `<sitemapindex>` (nested sitemaps). Elements are matched by local name, so
//! prefixed documents (`<sm:urlset>`) parse like unprefixed ones. A `<loc>`
//! counts only as the direct child of a `<url>` or `<sitemap>` entry, which
//! leaves extension locations such as `<image:loc>` out.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};
use url::Url;

/// Deepest nesting of sitemap indexes followed during a kickoff
pub const MAX_SITEMAP_DEPTH: u32 = 3;

/// A parsed sitemap document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sitemap {
    /// Page URLs
    UrlSet(Vec<String>),
    /// Locations of further sitemaps
    Index(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    UrlSet,
    Index,
}

impl Root {
    fn from_local_name(name: &[u8]) -> Option<Self> {
        match name {
            b"urlset" => Some(Root::UrlSet),
            b"sitemapindex" => Some(Root::Index),
            _ => None,
        }
    }
}

/// `path` holds the open elements above a `<loc>` start tag
fn is_entry_loc(path: &[Vec<u8>], name: &[u8]) -> bool {
    name == b"loc"
        && path.len() == 2
        && matches!(path[1].as_slice(), b"url" | b"sitemap")
}

/// Decode text content, tolerating HTML entities that plain XML rejects
fn decode_text(raw: &[u8]) -> String {
    html_escape::decode_html_entities(&String::from_utf8_lossy(raw)).into_owned()
}

/// Parse a sitemap document, or `None` when the root is neither `urlset` nor `sitemapindex`
///
/// A document that turns malformed halfway keeps the locations read before
/// the error.
pub fn parse_sitemap(xml: &str) -> Option<Sitemap> {
    let mut reader = Reader::from_str(xml);
    let mut root = None;
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut loc: Option<String> = None;
    let mut locs = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = start.local_name().as_ref().to_vec();
                if path.is_empty() {
                    root = Some(Root::from_local_name(&name)?);
                }
                if is_entry_loc(&path, &name) {
                    loc = Some(String::new());
                }
                path.push(name);
            }
            Ok(Event::Empty(empty)) => {
                if path.is_empty() {
                    root = Some(Root::from_local_name(empty.local_name().as_ref())?);
                    break;
                }
            }
            Ok(Event::Text(text)) => {
                if let Some(buf) = loc.as_mut() {
                    buf.push_str(&decode_text(&text));
                }
            }
            Ok(Event::CData(cdata)) => {
                if let Some(buf) = loc.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&cdata));
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
                if path.len() == 2 {
                    if let Some(value) = loc.take() {
                        let value = value.trim();
                        if !value.is_empty() {
                            locs.push(value.to_string());
                        }
                    }
                }
                if path.is_empty() {
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                debug!(
                    error = %e,
                    position = reader.buffer_position(),
                    parsed = locs.len(),
                    "Malformed sitemap"
                );
                break;
            }
            Ok(_) => {}
        }
    }

    Some(match root? {
        Root::Index => Sitemap::Index(locs),
        Root::UrlSet => Sitemap::UrlSet(locs),
    })
}

/// Conventional sitemap location for a site
pub fn default_sitemap_url(origin: &Url) -> Option<Url> {
    origin.join("/sitemap.xml").ok()
}

/// Walks a sitemap and its nested indexes
#[derive(Debug, Clone)]
pub struct SitemapFetcher {
    client: reqwest::Client,
    max_depth: u32,
}

impl SitemapFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            max_depth: MAX_SITEMAP_DEPTH,
        })
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    async fn fetch(&self, url: &str) -> Option<String> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Sitemap request failed");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(url = %url, status = response.status().as_u16(), "No sitemap");
            return None;
        }

        match response.text().await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to read sitemap body");
                None
            }
        }
    }

    /// Collect up to `limit` page URLs reachable from `sitemap_url`
    ///
    /// Unreachable or malformed sitemaps contribute nothing; this never fails.
    pub async fn fetch_urls(&self, sitemap_url: &str, limit: usize) -> Vec<String> {
        let mut urls = Vec::new();
        let mut seen_pages = HashSet::new();
        let mut seen_sitemaps = HashSet::new();
        let mut pending = VecDeque::from([(sitemap_url.to_string(), 1u32)]);

        while let Some((location, depth)) = pending.pop_front() {
            if urls.len() >= limit {
                break;
            }
            if !seen_sitemaps.insert(location.clone()) {
                continue;
            }

            let Some(body) = self.fetch(&location).await else {
                continue;
            };

            match parse_sitemap(&body) {
                Some(Sitemap::UrlSet(pages)) => {
                    debug!(sitemap = %location, pages = pages.len(), "Parsed sitemap");
                    for page in pages {
                        if urls.len() >= limit {
                            break;
                        }
                        if seen_pages.insert(page.clone()) {
                            urls.push(page);
                        }
                    }
                }
                Some(Sitemap::Index(children)) if depth < self.max_depth => {
                    debug!(sitemap = %location, children = children.len(), "Parsed sitemap index");
                    pending.extend(children.into_iter().map(|child| (child, depth + 1)));
                }
                Some(Sitemap::Index(_)) => {
                    debug!(sitemap = %location, depth, "Sitemap index nested too deeply");
                }
                None => debug!(sitemap = %location, "Not a sitemap document"),
            }
        }

        urls
    }
}
