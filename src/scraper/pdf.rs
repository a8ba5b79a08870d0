//! PDF download and text extraction
//!
//! The body is spooled to a [`NamedTempFile`] and parsed with lopdf on the
//! blocking pool. The temporary file is removed when it drops, whichever way
//! extraction ends.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::debug;

use super::error::ScrapeError;

/// Text pulled out of a PDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfText {
    pub text: String,
    pub num_pages: u32,
    pub status_code: u16,
}

/// Whether a URL names a PDF by its path
pub fn is_pdf_url(url: &str) -> bool {
    url::Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase().ends_with(".pdf"))
        .unwrap_or(false)
}

/// Downloads PDFs and extracts their text
#[derive(Debug, Clone)]
pub struct PdfExtractor {
    client: reqwest::Client,
}

impl PdfExtractor {
    pub fn new(timeout: Duration) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(Self { client })
    }

    /// Download `url` and extract per-page text
    ///
    /// Callers bound this with the remaining scrape budget.
    pub async fn extract(&self, url: &str) -> Result<PdfText, ScrapeError> {
        let response = self.client.get(url).send().await?;
        let status_code = response.status().as_u16();
        if !response.status().is_success() {
            return Err(ScrapeError::Pdf(format!(
                "download returned status {status_code}"
            )));
        }

        let bytes = response.bytes().await?;
        debug!(url = %url, bytes = bytes.len(), "Downloaded PDF");

        let (text, num_pages) = tokio::task::spawn_blocking(move || extract_from_bytes(&bytes))
            .await
            .map_err(|e| ScrapeError::Pdf(format!("extraction task failed: {e}")))??;

        Ok(PdfText {
            text,
            num_pages,
            status_code,
        })
    }
}

fn extract_from_bytes(bytes: &[u8]) -> Result<(String, u32), ScrapeError> {
    let mut file = NamedTempFile::new()?;
    file.write_all(bytes)?;
    file.flush()?;
    extract_text(file.path())
}

/// Extract text and page count from a PDF on disk
///
/// Pages whose text cannot be decoded are skipped.
pub fn extract_text(path: &Path) -> Result<(String, u32), ScrapeError> {
    let document = lopdf::Document::load(path).map_err(|e| ScrapeError::Pdf(e.to_string()))?;
    let pages = document.get_pages();

    let mut text = String::new();
    for page_number in pages.keys() {
        match document.extract_text(&[*page_number]) {
            Ok(page_text) => {
                text.push_str(page_text.trim());
                text.push_str("\n\n");
            }
            Err(e) => debug!(page = page_number, error = %e, "Skipping undecodable PDF page"),
        }
    }

    Ok((text.trim().to_string(), pages.len() as u32))
}
