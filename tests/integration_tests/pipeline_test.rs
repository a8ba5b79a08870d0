//! Scrape pipeline integration tests
//!
//! One wiremock server plays the crawled site and, where needed, a second
//! one plays the playwright rendering service.

use std::collections::HashMap;
use std::time::Duration;

use crawlq::scraper::{EngineKind, PageOptions, ScrapePipeline, ScraperConfig, Verdict};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::fixtures::{page, scraper_config, LOREM};

async fn site_with(at: &str, body: String) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/html"))
        .mount(&server)
        .await;
    server
}

fn with_playwright(service: &MockServer) -> ScraperConfig {
    ScraperConfig {
        engines: vec![EngineKind::Playwright, EngineKind::Fetch],
        playwright_url: Some(service.uri()),
        ..scraper_config()
    }
}

// ============================================================================
// Single engine
// ============================================================================

#[tokio::test]
async fn test_fetch_page_is_accepted() {
    let site = site_with("/article", page("Article", &["/next", "https://other.org/x"])).await;
    let pipeline = ScrapePipeline::from_config(&scraper_config()).unwrap();

    let url = format!("{}/article", site.uri());
    let report = pipeline.scrape(&url, &PageOptions::default()).await;

    assert_eq!(report.verdict, Verdict::Accepted);
    assert!(report.failure_reason().is_none());

    let document = report.document;
    assert_eq!(document.metadata.status_code, 200);
    assert_eq!(document.metadata.engine.as_deref(), Some("fetch"));
    assert_eq!(document.metadata.title.as_deref(), Some("Article"));
    assert_eq!(document.metadata.language.as_deref(), Some("en"));
    assert_eq!(document.final_url(), url);
    assert!(document.markdown.unwrap().contains("Crawl coordination"));
    assert_eq!(
        document.links,
        vec![format!("{}/next", site.uri()), "https://other.org/x".to_string()]
    );
}

#[tokio::test]
async fn test_only_main_content_drops_chrome() {
    let body = format!(
        r#"<html><head><title>Main</title></head><body>
        <nav>Navigation menu entries</nav>
        <main><p>{LOREM}</p></main>
        <footer>Copyright footer text</footer>
        </body></html>"#
    );
    let site = site_with("/", body).await;
    let pipeline = ScrapePipeline::from_config(&scraper_config()).unwrap();
    let url = format!("{}/", site.uri());

    let everything = PageOptions {
        only_main_content: false,
        ..Default::default()
    };
    let full = pipeline.scrape(&url, &everything).await;
    assert!(full.document.markdown.unwrap().contains("Copyright footer"));

    let main = pipeline.scrape(&url, &PageOptions::default()).await;
    assert_eq!(main.verdict, Verdict::Accepted);
    let markdown = main.document.markdown.unwrap();
    assert!(markdown.contains("Crawl coordination"));
    assert!(!markdown.contains("Copyright footer"));
    assert!(!markdown.contains("Navigation menu"));
}

#[tokio::test]
async fn test_deadline_exceeded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(page("Slow", &[]), "text/html")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    let pipeline = ScrapePipeline::from_config(&scraper_config()).unwrap();

    let options = PageOptions {
        timeout_ms: Some(200),
        ..Default::default()
    };
    let started = std::time::Instant::now();
    let report = pipeline
        .scrape(&format!("{}/slow", server.uri()), &options)
        .await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.verdict, Verdict::DeadlineExceeded);
    assert!(report.failure_reason().unwrap().contains("deadline"));
}

// ============================================================================
// Fallback
// ============================================================================

#[tokio::test]
async fn test_service_failure_falls_back_to_fetch() {
    let site = site_with("/", page("Home", &[])).await;
    let service = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/html"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&service)
        .await;

    let pipeline = ScrapePipeline::from_config(&with_playwright(&service)).unwrap();
    let report = pipeline
        .scrape(&format!("{}/", site.uri()), &PageOptions::default())
        .await;

    assert_eq!(report.verdict, Verdict::Accepted);
    assert_eq!(report.document.metadata.engine.as_deref(), Some("fetch"));
}

#[tokio::test]
async fn test_thin_render_falls_back_to_fetch() {
    let site = site_with("/", page("Home", &[])).await;
    let service = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/html"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": "<p>loading</p>",
            "pageStatusCode": 200
        })))
        .expect(1)
        .mount(&service)
        .await;

    let pipeline = ScrapePipeline::from_config(&with_playwright(&service)).unwrap();
    let report = pipeline
        .scrape(&format!("{}/", site.uri()), &PageOptions::default())
        .await;

    assert_eq!(report.verdict, Verdict::Accepted);
    assert_eq!(report.document.metadata.engine.as_deref(), Some("fetch"));
    assert_eq!(report.document.metadata.title.as_deref(), Some("Home"));
}

#[tokio::test]
async fn test_terminal_status_stops_chain() {
    let site = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&site)
        .await;
    let service = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/html"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": "<h1>Not Found</h1>",
            "pageStatusCode": 404
        })))
        .mount(&service)
        .await;

    let pipeline = ScrapePipeline::from_config(&with_playwright(&service)).unwrap();
    let report = pipeline
        .scrape(&format!("{}/missing", site.uri()), &PageOptions::default())
        .await;

    assert_eq!(report.verdict, Verdict::TerminalPage);
    assert!(report.verdict.is_success());
    assert_eq!(report.document.metadata.status_code, 404);
    assert_eq!(report.document.metadata.engine.as_deref(), Some("playwright"));
}

#[tokio::test]
async fn test_host_override_runs_first() {
    let site = site_with("/", page("Home", &[])).await;
    let service = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/html"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&service)
        .await;

    let host = url::Url::parse(&site.uri())
        .unwrap()
        .host_str()
        .unwrap()
        .to_string();
    let config = ScraperConfig {
        host_overrides: HashMap::from([(host, vec![EngineKind::Fetch])]),
        ..with_playwright(&service)
    };

    let pipeline = ScrapePipeline::from_config(&config).unwrap();
    let report = pipeline
        .scrape(&format!("{}/", site.uri()), &PageOptions::default())
        .await;

    assert_eq!(report.verdict, Verdict::Accepted);
    assert_eq!(report.document.metadata.engine.as_deref(), Some("fetch"));
}
