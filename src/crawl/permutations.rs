//! URL normalisation and permutation sets
//!
//! Two URLs are the same logical page when they differ only by scheme
//! (`http`/`https`), a leading `www.`, a trailing slash, or a trailing
//! `index.html`/`index.php`. Locking every member of that set keeps trivial
//! formatting differences from producing duplicate work.

use url::Url;

use super::error::CrawlError;

const INDEX_FILES: [&str; 2] = ["/index.html", "/index.php"];

/// Parse `url`, drop its fragment and, when asked, its query string
pub fn normalize_url(url: &str, ignore_query: bool) -> Result<Url, CrawlError> {
    let mut parsed = Url::parse(url.trim()).map_err(|e| CrawlError::invalid_url(url, e))?;
    parsed.set_fragment(None);
    if ignore_query {
        parsed.set_query(None);
    }
    Ok(parsed)
}

/// Host with a leading `www.` removed, unless that would leave a bare TLD
fn bare_host(host: &str) -> &str {
    match host.strip_prefix("www.") {
        Some(rest) if rest.contains('.') => rest,
        _ => host,
    }
}

/// Path with a trailing index file and trailing slashes removed
fn stem_path(path: &str) -> &str {
    let path = INDEX_FILES
        .iter()
        .find_map(|index| path.strip_suffix(index))
        .unwrap_or(path);
    path.trim_end_matches('/')
}

/// Every textual variant of the page `url` points at
///
/// The result always contains the serialised form of `url` itself. Non-HTTP
/// URLs have no variants and are returned alone.
pub fn generate_url_permutations(url: &Url) -> Vec<String> {
    let (Some(host), true) = (url.host_str(), matches!(url.scheme(), "http" | "https")) else {
        return vec![url.to_string()];
    };

    let bare = bare_host(host);
    let mut hosts = vec![bare.to_string()];
    if url.domain().is_some() {
        hosts.push(format!("www.{bare}"));
    }

    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();
    let stem = stem_path(url.path());
    let paths = [
        stem.to_string(),
        format!("{stem}/"),
        format!("{stem}/index.html"),
        format!("{stem}/index.php"),
    ];

    let mut permutations = Vec::with_capacity(2 * hosts.len() * paths.len() + 1);
    for scheme in ["http", "https"] {
        for host in &hosts {
            for path in &paths {
                let candidate = format!("{scheme}://{host}{port}{path}{query}");
                if !permutations.contains(&candidate) {
                    permutations.push(candidate);
                }
            }
        }
    }

    let own = url.to_string();
    if !permutations.contains(&own) {
        permutations.push(own);
    }
    permutations
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn perms(url: &str) -> HashSet<String> {
        generate_url_permutations(&Url::parse(url).unwrap())
            .into_iter()
            .collect()
    }

    #[test]
    fn test_root_permutations() {
        let set = perms("https://example.com/");
        assert!(set.contains("https://example.com/"));
        assert!(set.contains("http://example.com/"));
        assert!(set.contains("https://www.example.com/"));
        assert!(set.contains("http://www.example.com/index.html"));
        assert!(set.contains("https://example.com/index.php"));
    }

    #[test]
    fn test_equivalent_urls_share_a_set() {
        let base = perms("https://example.com/docs");
        for variant in [
            "http://example.com/docs/",
            "https://www.example.com/docs",
            "http://www.example.com/docs/index.html",
            "https://example.com/docs/index.php",
        ] {
            assert_eq!(perms(variant), base, "variant {variant}");
        }
        assert_ne!(perms("https://example.com/doc"), base);
    }

    #[test]
    fn test_query_and_port_are_kept() {
        let set = perms("http://localhost:8080/a?page=2");
        assert!(set.contains("http://localhost:8080/a?page=2"));
        assert!(set.contains("https://localhost:8080/a/?page=2"));
        assert!(!set.iter().any(|u| u.contains("www.")));
    }

    #[test]
    fn test_www_only_stripped_before_a_domain() {
        assert_eq!(bare_host("www.example.com"), "example.com");
        assert_eq!(bare_host("www.com"), "www.com");
    }

    #[test]
    fn test_non_http_urls_are_alone() {
        let url = Url::parse("mailto:someone@example.com").unwrap();
        assert_eq!(
            generate_url_permutations(&url),
            vec!["mailto:someone@example.com".to_string()]
        );
    }

    #[test]
    fn test_normalize_url() {
        let url = normalize_url("https://example.com/a?b=1#frag", false).unwrap();
        assert_eq!(url.as_str(), "https://example.com/a?b=1");
        let url = normalize_url("https://example.com/a?b=1#frag", true).unwrap();
        assert_eq!(url.as_str(), "https://example.com/a");
        assert!(normalize_url("not a url", false).is_err());
    }

    fn url_strategy() -> impl Strategy<Value = String> {
        (
            prop_oneof![Just("http"), Just("https")],
            any::<bool>(),
            "[a-z]{1,10}\\.(com|org|net)",
            prop::collection::vec("[a-z0-9]{1,8}", 0..4),
            prop_oneof![Just(""), Just("/"), Just("/index.html"), Just("/index.php")],
        )
            .prop_map(|(scheme, www, host, segments, tail)| {
                let prefix = if www { "www." } else { "" };
                let path = segments
                    .iter()
                    .map(|s| format!("/{s}"))
                    .collect::<String>();
                format!("{scheme}://{prefix}{host}{path}{tail}")
            })
    }

    proptest! {
        #[test]
        fn prop_contains_self(url in url_strategy()) {
            let parsed = Url::parse(&url).unwrap();
            let set = generate_url_permutations(&parsed);
            prop_assert!(set.contains(&parsed.to_string()));
        }

        #[test]
        fn prop_permutations_are_closed(url in url_strategy()) {
            let original = perms(&url);
            for variant in &original {
                prop_assert_eq!(&perms(variant), &original);
            }
        }
    }
}
