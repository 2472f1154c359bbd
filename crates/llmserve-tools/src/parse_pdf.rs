//! Text extraction from PDF documents.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use lopdf::Document;
use serde_json::{Value, json};
use url::Url;

use crate::ToolImplementation;
use llmserve_common::{Parameters, Property, Tool};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
enum Source {
    Remote(Url),
    Local(PathBuf),
}

impl Source {
    /// `http(s)` URLs are fetched, `file` URLs and anything else are read from disk.
    fn parse(location: &str) -> Self {
        match Url::parse(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Remote(url),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_or_else(|()| Self::Local(PathBuf::from(location)), Self::Local),
            _ => Self::Local(PathBuf::from(location)),
        }
    }
}

/// Extracts the text of every page as `Page N:\n<text>`, pages separated by a
/// blank line.
///
/// A page whose text cannot be decoded is reported with empty text.
///
/// # Errors
///
/// Returns an error if `bytes` is not a PDF document.
pub fn extract_pages(bytes: &[u8]) -> Result<String> {
    let document = Document::load_mem(bytes).context("not a readable PDF document")?;

    let pages: Vec<String> = document
        .get_pages()
        .into_keys()
        .map(|number| {
            let text = document.extract_text(&[number]).unwrap_or_else(|e| {
                warn!("No text extracted from page {number}: {e}");
                String::new()
            });
            format!("Page {number}:\n{text}")
        })
        .collect();
    Ok(pages.join("\n\n"))
}

/// Downloads or reads a PDF and returns its text page by page.
#[derive(Debug, Clone)]
pub struct ParsePdfTool {
    client: reqwest::Client,
}

impl Default for ParsePdfTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ParsePdfTool {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        match Source::parse(location) {
            Source::Remote(url) => {
                debug!("Downloading PDF from {url}");
                let response = self.client.get(url).send().await?.error_for_status()?;
                Ok(response.bytes().await?.to_vec())
            }
            Source::Local(path) => tokio::fs::read(&path)
                .await
                .with_context(|| format!("cannot read {}", path.display())),
        }
    }
}

#[async_trait]
impl ToolImplementation for ParsePdfTool {
    fn get_definition(&self) -> Tool {
        Tool::function(
            "parse_pdf",
            "Parse and extract text content from a PDF file",
            Parameters::from_fields([(
                "url",
                Property::string("URL or file path to the PDF document"),
                true,
            )]),
        )
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let location = args
            .get("url")
            .and_then(Value::as_str)
            .context("Missing 'url' parameter")?;

        let bytes = self
            .fetch(location)
            .await
            .context("Error parsing PDF")?;
        let text = tokio::task::spawn_blocking(move || extract_pages(&bytes))
            .await?
            .context("Error parsing PDF")?;
        Ok(json!(text))
    }

    fn timeout(&self) -> Option<Duration> {
        Some(DEFAULT_TIMEOUT)
    }
}
