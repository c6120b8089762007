use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

const HTML_RENDER_WIDTH: usize = 1000;

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Returns the cleaned plain text behind a document reference.
    async fn fetch_document(&self, reference: &str) -> Result<String>;
}

pub struct HttpDocumentFetcher {
    client: reqwest::Client,
}

impl HttpDocumentFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentFetcher for HttpDocumentFetcher {
    async fn fetch_document(&self, reference: &str) -> Result<String> {
        let url = export_url(reference)?;
        log::info!("Fetching document: {}", url);

        let resp = self.client.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("Document request failed ({}) for {}", resp.status(), url));
        }

        let is_html = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("html"))
            .unwrap_or(false);
        let body = resp.bytes().await?;

        let raw = if is_html {
            html2text::from_read(&body[..], HTML_RENDER_WIDTH)
                .map_err(|e| anyhow!("Failed to convert HTML document: {}", e))?
        } else {
            String::from_utf8_lossy(&body).into_owned()
        };

        let text = clean_text(&raw);
        log::info!("Fetched document: {} characters", text.len());
        Ok(text)
    }
}

/// Maps a Google Docs link to its plain-text export. Any other URL is
/// fetched as given.
pub fn export_url(reference: &str) -> Result<Url> {
    let url = Url::parse(reference.trim())
        .with_context(|| format!("Not a valid document URL: {}", reference))?;

    if url.host_str() != Some("docs.google.com") {
        return Ok(url);
    }

    let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
    let doc_id = segments
        .iter()
        .position(|s| *s == "d")
        .and_then(|i| segments.get(i + 1).copied())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| anyhow!("Google Docs URL has no document id: {}", reference))?;

    let mut export = Url::parse("https://docs.google.com/")?;
    export
        .path_segments_mut()
        .map_err(|_| anyhow!("Cannot build export URL"))?
        .pop_if_empty()
        .extend(["document", "d", doc_id, "export"]);
    export.query_pairs_mut().append_pair("format", "txt");
    Ok(export)
}

/// Trims every line, breaks on runs of two spaces and drops blank pieces.
pub fn clean_text(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .flat_map(|line| line.split("  "))
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
