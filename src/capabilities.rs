//! External capabilities consumed by the pipeline.
//!
//! Each capability is a trait so tests can swap in mocks; the production
//! implementations live alongside.

use std::future::Future;
use std::io::Write;
use std::panic::catch_unwind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProcessingConfig;

/// Output of a text-extraction backend. `raw_text` separates pages with form feeds.
#[derive(Debug, Clone, Default)]
pub struct RawExtraction {
    pub page_count: usize,
    pub raw_text: String,
}

/// `(bytes) -> {pageCount, rawText}`; blocking, may fail on malformed input
pub trait TextExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, bytes: &[u8]) -> Result<RawExtraction>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrPage {
    pub identifier: String,
    pub text: String,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &'static str;
    async fn recognize(&self, path: &Path, language: &str) -> Result<Vec<OcrPage>>;
}

#[async_trait]
pub trait AiTextCapability: Send + Sync {
    async fn complete(&self, system: &str, user: &str, max_tokens: u32, temperature: f32) -> Result<String>;
}

/// "Given a file path, produce a repaired file path or fail"
#[async_trait]
pub trait ExternalRepairer: Send + Sync {
    async fn repair(&self, input: &Path, output: &Path) -> Result<PathBuf>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<String>;
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
    async fn delete(&self, url: &str) -> Result<bool>;
}

/// Bound an external call. A timeout becomes an ordinary error.
pub async fn with_timeout<T, F>(limit: Duration, label: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("{} timed out after {}s", label, limit.as_secs()),
    }
}

/// The set of capabilities a service instance works with
#[derive(Clone)]
pub struct Capabilities {
    pub extractors: Vec<Arc<dyn TextExtractor>>,
    pub ocr: Option<Arc<dyn OcrEngine>>,
    pub ai: Option<Arc<dyn AiTextCapability>>,
    pub repairer: Option<Arc<dyn ExternalRepairer>>,
    pub blob_store: Option<Arc<dyn BlobStore>>,
}

impl Capabilities {
    /// Local text extraction only; no network or external tools
    pub fn offline() -> Self {
        Self {
            extractors: default_extractors(),
            ocr: None,
            ai: None,
            repairer: None,
            blob_store: None,
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Result<Self> {
        let mut capabilities = Self::offline();

        if let Some(key) = &config.ai_api_key {
            let client = OpenAiCompatibleClient::new(&config.ai_endpoint, &config.ai_model, key, config.capability_timeout)?;
            capabilities.ai = Some(Arc::new(client));
        } else {
            log::info!("No AI API key configured, name and result extraction will be limited");
        }

        if let Some(key) = &config.ocr_api_key {
            let engine = OcrSpaceEngine::new(&config.ocr_endpoint, key, config.capability_timeout)?;
            capabilities.ocr = Some(Arc::new(engine));
        } else {
            log::info!("No OCR API key configured, OCR stages are disabled");
        }

        if config.external_tools_enabled {
            capabilities.repairer = Some(Arc::new(GhostscriptRepairer::default()));
        }

        if let Some(dir) = &config.blob_dir {
            log::info!("Large uploads are offloaded to {}", dir.display());
            capabilities.blob_store = Some(Arc::new(LocalBlobStore::new(dir)));
        }

        Ok(capabilities)
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiTextCapability>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_repairer(mut self, repairer: Arc<dyn ExternalRepairer>) -> Self {
        self.repairer = Some(repairer);
        self
    }

    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }
}

/// Backends in order of preference
pub fn default_extractors() -> Vec<Arc<dyn TextExtractor>> {
    vec![Arc::new(PdfExtractBackend), Arc::new(LopdfBackend)]
}

/// `pdf-extract` text layer extraction. Fast but panics on some inputs.
pub struct PdfExtractBackend;

impl TextExtractor for PdfExtractBackend {
    fn name(&self) -> &'static str {
        "pdf-extract"
    }

    fn extract(&self, bytes: &[u8]) -> Result<RawExtraction> {
        let pages = match catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes)) {
            Ok(result) => result.map_err(|e| anyhow::anyhow!("pdf-extract failed: {}", e))?,
            Err(_) => anyhow::bail!("pdf-extract panicked"),
        };
        Ok(RawExtraction {
            page_count: pages.len(),
            raw_text: pages.join("\x0C"),
        })
    }
}

/// `lopdf` page-by-page extraction; slower but tolerates more fonts
pub struct LopdfBackend;

impl TextExtractor for LopdfBackend {
    fn name(&self) -> &'static str {
        "lopdf"
    }

    fn extract(&self, bytes: &[u8]) -> Result<RawExtraction> {
        let pdf = crate::pdf_surgery::load_tolerant(bytes)?;
        let pages = pdf.get_pages();
        let mut texts = Vec::with_capacity(pages.len());
        for &number in pages.keys() {
            match pdf.extract_text(&[number]) {
                Ok(text) => texts.push(text),
                Err(e) => {
                    log::debug!("lopdf could not extract page {}: {}", number, e);
                    texts.push(String::new());
                }
            }
        }
        Ok(RawExtraction {
            page_count: pages.len(),
            raw_text: texts.join("\x0C"),
        })
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint
pub struct OpenAiCompatibleClient {
    endpoint: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(endpoint: &str, model: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }
}

#[async_trait]
impl AiTextCapability for OpenAiCompatibleClient {
    async fn complete(&self, system: &str, user: &str, max_tokens: u32, temperature: f32) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens,
            temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("AI request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("AI endpoint returned {}: {}", status.as_u16(), body);
        }

        let parsed: ChatResponse = response.json().await.context("Malformed AI response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .context("AI response contained no choices")
    }
}

/// OCR.space-style engine: multipart upload of a PDF, one result per page
pub struct OcrSpaceEngine {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OcrSpaceResponse {
    #[serde(default)]
    parsed_results: Vec<OcrSpaceResult>,
    #[serde(default)]
    is_errored_on_processing: bool,
    #[serde(default)]
    error_message: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OcrSpaceResult {
    #[serde(default)]
    parsed_text: String,
}

impl OcrSpaceEngine {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }
}

#[async_trait]
impl OcrEngine for OcrSpaceEngine {
    fn name(&self) -> &'static str {
        "ocr.space"
    }

    async fn recognize(&self, path: &Path, language: &str) -> Result<Vec<OcrPage>> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read OCR input: {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());

        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name)
            .mime_str("application/pdf")
            .context("Invalid MIME type")?;
        let form = reqwest::multipart::Form::new()
            .text("language", language.to_string())
            .text("filetype", "PDF")
            .text("isOverlayRequired", "false")
            .text("scale", "true")
            .part("file", part);

        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("OCR request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OCR endpoint returned {}: {}", status.as_u16(), body);
        }

        let parsed: OcrSpaceResponse = response.json().await.context("Malformed OCR response")?;
        if parsed.is_errored_on_processing {
            let detail = parsed.error_message.map(|v| v.to_string()).unwrap_or_default();
            anyhow::bail!("OCR processing failed: {}", detail);
        }

        Ok(parsed
            .parsed_results
            .into_iter()
            .enumerate()
            .map(|(i, result)| OcrPage {
                identifier: format!("{}", i + 1),
                text: result.parsed_text,
            })
            .collect())
    }
}

/// Rewrites a file through Ghostscript's pdfwrite device
pub struct GhostscriptRepairer {
    binary: String,
}

impl Default for GhostscriptRepairer {
    fn default() -> Self {
        Self { binary: "gs".to_string() }
    }
}

#[async_trait]
impl ExternalRepairer for GhostscriptRepairer {
    async fn repair(&self, input: &Path, output: &Path) -> Result<PathBuf> {
        let result = tokio::process::Command::new(&self.binary)
            .arg("-o")
            .arg(output)
            .args(["-sDEVICE=pdfwrite", "-dPDFSETTINGS=/prepress", "-dNOPAUSE", "-dBATCH", "-dQUIET"])
            .arg(input)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary))?;

        if !result.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.binary,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }

        let written = tokio::fs::metadata(output)
            .await
            .with_context(|| format!("{} produced no output", self.binary))?;
        if written.len() == 0 {
            anyhow::bail!("{} produced an empty file", self.binary);
        }
        Ok(output.to_path_buf())
    }
}

/// Blob store backed by a local directory; URLs are `file://` paths
pub struct LocalBlobStore {
    dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_of(url: &str) -> Result<PathBuf> {
        url.strip_prefix("file://")
            .map(PathBuf::from)
            .with_context(|| format!("Unsupported blob URL: {}", url))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create blob dir: {}", self.dir.display()))?;
        let dir = self.dir.clone();
        let bytes = bytes.to_vec();
        let path = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            let prefix = format!("blob-{}-", chrono::Utc::now().format("%Y%m%d%H%M%S"));
            let mut file = tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".pdf")
                .tempfile_in(&dir)
                .with_context(|| format!("Failed to create blob in {}", dir.display()))?;
            file.write_all(&bytes)
                .with_context(|| format!("Failed to write blob: {}", file.path().display()))?;
            let (_, path) = file.keep().context("Failed to persist blob")?;
            Ok(path)
        })
        .await
        .context("Blob write task failed")??;
        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let path = Self::path_of(url)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob: {}", path.display()))
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        let path = Self::path_of(url)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete blob: {}", path.display())),
        }
    }
}
