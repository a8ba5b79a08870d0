//! HTML transforms: cleaning, link and metadata extraction, markdown
//!
//! Everything here is pure and synchronous; the pipeline calls it after an
//! engine has produced a page body.

use std::collections::HashSet;

use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::document::{DocumentMetadata, PageOptions};

macro_rules! parse_selector {
    ($s:expr) => {
        Selector::parse($s).expect(concat!("Invalid CSS selector: ", $s))
    };
}

lazy_static! {
    static ref ALWAYS_REMOVED: Selector = parse_selector!("head, meta, noscript, style, script");

    static ref NON_MAIN: Vec<Selector> = [
        "header", "footer", "nav", "aside", ".header", ".top", ".navbar", "#header",
        ".footer", ".bottom", "#footer", ".sidebar", ".side", ".aside", "#sidebar",
        ".modal", ".popup", "#modal", ".overlay", ".ad", ".ads", ".advert", "#ad",
        ".lang-selector", ".language", "#language-selector", ".social", ".social-media",
        ".social-links", "#social", ".menu", ".navigation", "#nav", ".breadcrumbs",
        "#breadcrumbs", ".share", "#share", ".widget", "#widget", ".cookie", "#cookie",
    ]
    .iter()
    .map(|s| Selector::parse(s).expect("Invalid CSS selector"))
    .collect();

    /// Non-main containers wrapping this are kept
    static ref FORCE_MAIN: Selector = parse_selector!("#main");

    static ref ANCHOR: Selector = parse_selector!("a[href]");
    static ref BASE_HREF: Selector = parse_selector!("base[href]");
    static ref TITLE: Selector = parse_selector!("title");
    static ref HTML_LANG: Selector = parse_selector!("html[lang]");
    static ref ICON_EXACT: Selector = parse_selector!("link[rel=\"icon\"]");
    static ref ICON_ANY: Selector = parse_selector!("link[rel*=\"icon\"]");
    static ref OG_LOCALE_ALTERNATE: Selector =
        parse_selector!("meta[property=\"og:locale:alternate\"]");
}

/// Parse user-supplied selectors, skipping the invalid ones
fn parse_user_selectors(selectors: &[String]) -> Vec<Selector> {
    selectors
        .iter()
        .filter_map(|raw| match Selector::parse(raw) {
            Ok(selector) => Some(selector),
            Err(e) => {
                tracing::debug!(selector = %raw, error = %e, "Ignoring invalid selector");
                None
            }
        })
        .collect()
}

/// Detach every element matching `selector` that does not contain `keep`
fn detach_matching(document: &mut Html, selector: &Selector, keep: Option<&Selector>) {
    let ids: Vec<_> = document
        .select(selector)
        .filter(|el| keep.map_or(true, |keep| el.select(keep).next().is_none()))
        .map(|el| el.id())
        .collect();

    for id in ids {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
}

/// Produce the cleaned HTML for a document
pub fn transform_html(html: &str, options: &PageOptions) -> String {
    let mut document = if options.include_tags.is_empty() {
        Html::parse_document(html)
    } else {
        let source = Html::parse_document(html);
        let mut kept = String::from("<div>");
        for selector in parse_user_selectors(&options.include_tags) {
            for element in source.select(&selector) {
                kept.push_str(&element.html());
            }
        }
        kept.push_str("</div>");
        Html::parse_document(&kept)
    };

    detach_matching(&mut document, &ALWAYS_REMOVED, None);

    for selector in parse_user_selectors(&options.exclude_tags) {
        detach_matching(&mut document, &selector, None);
    }

    if options.only_main_content {
        for selector in NON_MAIN.iter() {
            detach_matching(&mut document, selector, Some(&FORCE_MAIN));
        }
    }

    document.html()
}

/// Fix `http:/host` and `https:/host` typos
fn repair_scheme(href: &str) -> String {
    for (broken, fixed) in [("https:/", "https://"), ("http:/", "http://")] {
        if let Some(rest) = href.strip_prefix(broken) {
            if !rest.starts_with('/') {
                return format!("{fixed}{rest}");
            }
        }
    }
    href.to_string()
}

fn is_non_page_href(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    href.starts_with('#')
        || lower.starts_with("mailto:")
        || lower.starts_with("javascript:")
        || lower.starts_with("tel:")
}

/// Absolute, de-duplicated http(s) links found in `html`
///
/// Relative hrefs resolve against `<base href>` when present, otherwise the
/// page URL. Fragments are stripped.
pub fn extract_links(html: &str, page_url: &str) -> Vec<String> {
    let Ok(page) = Url::parse(page_url) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);

    let base = document
        .select(&BASE_HREF)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| page.join(href.trim()).ok())
        .unwrap_or(page);

    let mut seen = HashSet::new();
    document
        .select(&ANCHOR)
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty() && !is_non_page_href(href))
        .filter_map(|href| base.join(&repair_scheme(href)).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|mut url| {
            url.set_fragment(None);
            url.to_string()
        })
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn meta_content(document: &Html, attr: &str, name: &str) -> Option<String> {
    let selector = Selector::parse(&format!("meta[{attr}=\"{name}\"]")).ok()?;
    document
        .select(&selector)
        .find_map(|el| el.value().attr("content"))
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
}

/// Fill title, description, language, favicon and social tags from the page head
pub fn extract_metadata(html: &str, metadata: &mut DocumentMetadata) {
    let document = Html::parse_document(html);

    metadata.title = document
        .select(&TITLE)
        .next()
        .map(text_of)
        .filter(|title| !title.is_empty());
    metadata.description = meta_content(&document, "name", "description");
    metadata.keywords = meta_content(&document, "name", "keywords");
    metadata.robots = meta_content(&document, "name", "robots");
    metadata.language = document
        .select(&HTML_LANG)
        .next()
        .and_then(|el| el.value().attr("lang"))
        .map(str::to_string);
    metadata.favicon = document
        .select(&ICON_EXACT)
        .next()
        .or_else(|| document.select(&ICON_ANY).next())
        .and_then(|el| el.value().attr("href"))
        .map(str::to_string);

    metadata.og_title = meta_content(&document, "property", "og:title");
    metadata.og_description = meta_content(&document, "property", "og:description");
    metadata.og_url = meta_content(&document, "property", "og:url");
    metadata.og_image = meta_content(&document, "property", "og:image");
    metadata.og_audio = meta_content(&document, "property", "og:audio");
    metadata.og_determiner = meta_content(&document, "property", "og:determiner");
    metadata.og_locale = meta_content(&document, "property", "og:locale");
    metadata.og_locale_alternate = document
        .select(&OG_LOCALE_ALTERNATE)
        .filter_map(|el| el.value().attr("content"))
        .map(str::to_string)
        .collect();
    metadata.og_site_name = meta_content(&document, "property", "og:site_name");
    metadata.og_video = meta_content(&document, "property", "og:video");
    metadata.published_time = meta_content(&document, "property", "article:published_time");
    metadata.modified_time = meta_content(&document, "property", "article:modified_time");
}

/// Convert HTML to Markdown, falling back to plain text
pub fn html_to_markdown(html: &str) -> String {
    htmd::convert(html).unwrap_or_else(|_| {
        let document = Html::parse_document(html);
        document.root_element().text().collect::<String>()
    })
}
