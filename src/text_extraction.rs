use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::capabilities::{with_timeout, OcrEngine, TextExtractor};
use crate::config::ProcessingConfig;
use crate::document::{pages_from_raw_text, Document, Page, RecoveredText};
use crate::pdf_surgery::{self, DocumentPart};
use crate::temp_resources::TempResourceManager;

lazy_static! {
    static ref RE_DECIMAL_COMMA: Regex = Regex::new(r"(\d),(\d)").unwrap();
    static ref RE_INLINE_WHITESPACE: Regex = Regex::new(r"[ \t\u{a0}]+").unwrap();
    static ref RE_BLANK_RUN: Regex = Regex::new(r"\n{3,}").unwrap();
    static ref RE_NAME_HINT: Regex =
        Regex::new(r"(?i:paciente|nome)\s*[:\-]?\s*([A-ZÀ-Ý][A-Za-zÀ-ÿ]+(?:[ ]+[A-ZÀ-Ý][A-Za-zÀ-ÿ]+)+)").unwrap();
    static ref RE_DATE_HINT: Regex = Regex::new(r"\b(\d{2}/\d{2}/\d{4})\b").unwrap();
}

/// Frequent OCR misreads in lab-report vocabulary
const OCR_MISREADS: &[(&str, &str)] = &[
    ("GIicose", "Glicose"),
    ("Gllcose", "Glicose"),
    ("Pac1ente", "Paciente"),
    ("Pacicnte", "Paciente"),
    ("Hemogl0bina", "Hemoglobina"),
    ("Hemoglobrna", "Hemoglobina"),
    ("Co1esterol", "Colesterol"),
    ("Colesteroi", "Colesterol"),
    ("Creatinlna", "Creatinina"),
    ("Trig1icerides", "Triglicerides"),
    ("Leuc0citos", "Leucocitos"),
    ("P1aquetas", "Plaquetas"),
    ("Refer6ncia", "Referencia"),
    ("VaIor", "Valor"),
];

/// Which cascade tier produced the text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    Direct,
    Normalized,
    PerPage,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub tier: ExtractionTier,
    pub backend: &'static str,
    pub text: RecoveredText,
}

/// Best-effort facts scraped when no tier produced usable text
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSummary {
    pub page_count: Option<usize>,
    pub encrypted: bool,
    pub size: usize,
    pub name_hints: Vec<String>,
    pub date_hints: Vec<String>,
}

impl MetadataSummary {
    pub fn describe(&self) -> String {
        let pages = self
            .page_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let mut text = format!(
            "Document metadata: {} pages, {} bytes, encrypted: {}",
            pages,
            self.size,
            if self.encrypted { "yes" } else { "no" }
        );
        if !self.name_hints.is_empty() {
            text.push_str(&format!("\nPossible names: {}", self.name_hints.join(", ")));
        }
        if !self.date_hints.is_empty() {
            text.push_str(&format!("\nDates found: {}", self.date_hints.join(", ")));
        }
        text
    }
}

/// Every text tier failed. Carries the metadata-only scrape.
#[derive(Debug, Clone, Error)]
#[error("no usable text layer: {}", .errors.join("; "))]
pub struct ExtractionFailure {
    pub errors: Vec<String>,
    pub metadata: MetadataSummary,
}

/// Uniform "bytes -> pages of text" front for the extraction and OCR capabilities
#[derive(Clone)]
pub struct TextExtractionAdapter {
    extractors: Vec<Arc<dyn TextExtractor>>,
    min_text_length: usize,
    scan_bytes: usize,
    ocr_payload_limit: usize,
    ocr_language: String,
    timeout: Duration,
}

impl TextExtractionAdapter {
    pub fn new(config: &ProcessingConfig, extractors: Vec<Arc<dyn TextExtractor>>) -> Self {
        Self {
            extractors,
            min_text_length: config.min_text_length,
            scan_bytes: config.protection_scan_bytes,
            ocr_payload_limit: config.ocr_payload_limit,
            ocr_language: config.ocr_language.clone(),
            timeout: config.capability_timeout,
        }
    }

    /// Run the text cascade: direct, normalized, per-page. Falls through to
    /// a metadata-only scrape carried in the error. On timeout the carried
    /// metadata holds only the byte size.
    pub async fn extract(&self, doc: &Document) -> std::result::Result<Extraction, ExtractionFailure> {
        let extractors = self.extractors.clone();
        let bytes = doc.shared_bytes();
        let min = self.min_text_length;
        let scan = self.scan_bytes;

        let task = async move {
            tokio::task::spawn_blocking(move || run_cascade(&extractors, &bytes, min, scan))
                .await
                .context("Extraction task failed")
        };

        match with_timeout(self.timeout, "text extraction", task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Extraction of {} gave up: {:#}", doc.filename(), e);
                Err(ExtractionFailure {
                    errors: vec![format!("{:#}", e)],
                    metadata: MetadataSummary {
                        size: doc.len(),
                        ..MetadataSummary::default()
                    },
                })
            }
        }
    }

    /// Only the direct tier, used for split parts
    pub async fn extract_text_layer(&self, bytes: Vec<u8>) -> Result<(&'static str, RecoveredText)> {
        let extractors = self.extractors.clone();
        let min = self.min_text_length;
        let task = async move {
            tokio::task::spawn_blocking(move || run_backends(&extractors, &bytes, min))
                .await
                .context("Extraction task failed")?
        };
        with_timeout(self.timeout, "text extraction", task).await
    }

    /// OCR the document, chunked under the payload limit. Parts are sent
    /// concurrently; results keep document order.
    pub async fn ocr(
        &self,
        doc: &Document,
        engine: &dyn OcrEngine,
        temp: &mut TempResourceManager,
    ) -> Result<RecoveredText> {
        let bytes = doc.shared_bytes();
        let limit = self.ocr_payload_limit;
        let parts = tokio::task::spawn_blocking(move || plan_ocr_parts(&bytes, limit))
            .await
            .context("OCR planning task failed")??;

        let mut jobs = Vec::with_capacity(parts.len());
        for part in &parts {
            let path = temp.write("ocr-part", &part.bytes)?;
            jobs.push((part.first_page, path));
        }
        log::info!("Sending {} part(s) to {} OCR", jobs.len(), engine.name());

        let language = self.ocr_language.as_str();
        let calls = jobs.iter().map(|(_, path)| {
            with_timeout(self.timeout, "OCR", engine.recognize(path, language))
        });
        let results = futures::future::join_all(calls).await;

        let mut pages = Vec::new();
        let mut errors = Vec::new();
        for ((first_page, _), result) in jobs.iter().zip(results) {
            match result {
                Ok(ocr_pages) => {
                    for ocr_page in ocr_pages {
                        let text = clean_ocr_text(&ocr_page.text);
                        let page = match ocr_page.identifier.trim().parse::<usize>() {
                            Ok(n) if n > 0 => Page::numbered(first_page + n - 1, text),
                            _ => Page::labeled(ocr_page.identifier, text),
                        };
                        pages.push(page);
                    }
                }
                Err(e) => {
                    log::warn!("OCR failed for part starting at page {}: {:#}", first_page, e);
                    errors.push(format!("part@{}: {:#}", first_page, e));
                }
            }
        }

        if pages.is_empty() {
            anyhow::bail!("OCR produced no pages: {}", errors.join("; "));
        }
        Ok(RecoveredText::new(pages))
    }
}

fn run_cascade(
    extractors: &[Arc<dyn TextExtractor>],
    bytes: &[u8],
    min: usize,
    scan_bytes: usize,
) -> std::result::Result<Extraction, ExtractionFailure> {
    let mut errors = Vec::new();

    match run_backends(extractors, bytes, min) {
        Ok((backend, text)) => {
            return Ok(Extraction {
                tier: ExtractionTier::Direct,
                backend,
                text,
            });
        }
        Err(e) => errors.push(format!("direct: {:#}", e)),
    }

    match normalized_extract(extractors, bytes, min) {
        Ok((backend, text)) => {
            return Ok(Extraction {
                tier: ExtractionTier::Normalized,
                backend,
                text,
            });
        }
        Err(e) => errors.push(format!("normalized: {:#}", e)),
    }

    match per_page_extract(extractors, bytes, min) {
        Ok((backend, text)) => {
            return Ok(Extraction {
                tier: ExtractionTier::PerPage,
                backend,
                text,
            });
        }
        Err(e) => errors.push(format!("per-page: {:#}", e)),
    }

    Err(ExtractionFailure {
        errors,
        metadata: metadata_only(bytes, scan_bytes),
    })
}

/// Try each backend in order; the first usable result wins
fn run_backends(extractors: &[Arc<dyn TextExtractor>], bytes: &[u8], min: usize) -> Result<(&'static str, RecoveredText)> {
    let mut failures = Vec::new();

    for backend in extractors {
        match backend.extract(bytes) {
            Ok(raw) => {
                let text = RecoveredText::new(pages_from_raw_text(&raw.raw_text));
                if text.is_usable(min) {
                    log::debug!("{} extracted {} pages", backend.name(), text.len());
                    return Ok((backend.name(), text));
                }
                failures.push(format!("{}: only {} chars on first page", backend.name(), text.first_text_len()));
            }
            Err(e) => {
                log::warn!("Backend {} failed: {:#}", backend.name(), e);
                failures.push(format!("{}: {:#}", backend.name(), e));
            }
        }
    }

    anyhow::bail!("{}", failures.join(", "))
}

/// Reload tolerantly, rebuild page by page, then extract
fn normalized_extract(extractors: &[Arc<dyn TextExtractor>], bytes: &[u8], min: usize) -> Result<(&'static str, RecoveredText)> {
    let pdf = pdf_surgery::load_tolerant(bytes)?;
    let rebuilt = pdf_surgery::rebuild_pages(pdf)?;
    let (backend, mut text) = run_backends(extractors, &rebuilt.bytes, min)?;
    if text.len() == rebuilt.page_count() {
        text.mark_unrecoverable(&rebuilt.error_pages);
    }
    Ok((backend, text))
}

/// Extract every page on its own and stitch the results together
fn per_page_extract(extractors: &[Arc<dyn TextExtractor>], bytes: &[u8], min: usize) -> Result<(&'static str, RecoveredText)> {
    let parts = pdf_surgery::split_into_parts(bytes, 1)?;
    let total = pdf_surgery::page_count(bytes)?;
    let mut backend_used = "";
    let mut pages = Vec::with_capacity(total);

    for index in 1..=total {
        let Some(part) = parts.iter().find(|p| p.first_page == index) else {
            pages.push(Page::Unrecoverable { index });
            continue;
        };
        let mut extracted = None;
        for backend in extractors {
            if let Ok(raw) = backend.extract(&part.bytes) {
                let text = raw.raw_text.replace('\x0C', "\n").trim().to_string();
                if !text.is_empty() {
                    extracted = Some((backend.name(), text));
                    break;
                }
            }
        }
        match extracted {
            Some((name, text)) => {
                backend_used = name;
                pages.push(Page::numbered(index, text));
            }
            None => pages.push(Page::Unrecoverable { index }),
        }
    }

    let text = RecoveredText::new(pages);
    if !text.is_usable(min) {
        anyhow::bail!("per-page text too short ({} chars on first page)", text.first_text_len());
    }
    Ok((backend_used, text))
}

/// Metadata-only scrape: page count, encryption flag, size and text hints
/// from the raw byte prefix
pub fn metadata_only(bytes: &[u8], scan_bytes: usize) -> MetadataSummary {
    let prefix: String = bytes[..bytes.len().min(scan_bytes)].iter().map(|&b| b as char).collect();
    let loaded = pdf_surgery::load_tolerant(bytes).ok();

    let mut name_hints: Vec<String> = Vec::new();
    for cap in RE_NAME_HINT.captures_iter(&prefix) {
        if let Some(m) = cap.get(1) {
            let hint = m.as_str().trim().to_string();
            if !name_hints.contains(&hint) {
                name_hints.push(hint);
            }
        }
    }
    let mut date_hints: Vec<String> = Vec::new();
    for cap in RE_DATE_HINT.captures_iter(&prefix) {
        if let Some(m) = cap.get(1) {
            let hint = m.as_str().to_string();
            if !date_hints.contains(&hint) {
                date_hints.push(hint);
            }
        }
    }

    MetadataSummary {
        page_count: loaded.as_ref().map(|pdf| pdf.get_pages().len()),
        encrypted: loaded.as_ref().is_some_and(|pdf| pdf.is_encrypted()) || prefix.contains("/Encrypt"),
        size: bytes.len(),
        name_hints: name_hints.into_iter().take(3).collect(),
        date_hints: date_hints.into_iter().take(3).collect(),
    }
}

/// Cut a document into OCR-sized parts. Parts still over the limit get a
/// compression pass; a document that cannot be split is sent whole.
pub fn plan_ocr_parts(bytes: &[u8], payload_limit: usize) -> Result<Vec<DocumentPart>> {
    let whole = |bytes: &[u8]| DocumentPart {
        first_page: 1,
        last_page: pdf_surgery::page_count(bytes).unwrap_or(1).max(1),
        bytes: bytes.to_vec(),
    };

    if bytes.len() <= payload_limit {
        return Ok(vec![whole(bytes)]);
    }

    let total = match pdf_surgery::page_count(bytes) {
        Ok(total) if total > 0 => total,
        _ => {
            log::warn!("Cannot split {} byte document for OCR, sending whole", bytes.len());
            return Ok(vec![whole(bytes)]);
        }
    };

    let per_part = ((total * payload_limit) / bytes.len()).clamp(1, total);
    let mut parts = pdf_surgery::split_into_parts(bytes, per_part)?;

    for part in &mut parts {
        if part.bytes.len() > payload_limit {
            match pdf_surgery::compress(&part.bytes) {
                Ok(smaller) if smaller.len() < part.bytes.len() => {
                    log::debug!("Compressed OCR part {} from {} to {} bytes", part.label(), part.bytes.len(), smaller.len());
                    part.bytes = smaller;
                }
                Ok(_) => {}
                Err(e) => log::debug!("Compression of part {} failed: {:#}", part.label(), e),
            }
            if part.bytes.len() > payload_limit {
                log::warn!("OCR part {} is still {} bytes, over the {} byte limit", part.label(), part.bytes.len(), payload_limit);
            }
        }
    }

    Ok(parts)
}

/// Deterministic OCR cleanup: whitespace collapse, decimal commas, misreads
pub fn clean_ocr_text(text: &str) -> String {
    let mut cleaned: String = text
        .replace("\r\n", "\n")
        .lines()
        .map(|line| RE_INLINE_WHITESPACE.replace_all(line.trim(), " ").into_owned())
        .collect::<Vec<_>>()
        .join("\n");
    cleaned = RE_BLANK_RUN.replace_all(&cleaned, "\n\n").into_owned();
    cleaned = RE_DECIMAL_COMMA.replace_all(&cleaned, "$1.$2").into_owned();

    for (wrong, right) in OCR_MISREADS {
        if cleaned.contains(wrong) {
            cleaned = cleaned.replace(wrong, right);
        }
    }

    cleaned.trim().to_string()
}
