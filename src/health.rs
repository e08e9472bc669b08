use std::path::Path;

use lazy_static::lazy_static;
use memchr::memmem;
use regex::bytes::Regex;
use serde::Serialize;

use crate::document::Document;
use crate::error::{LabReportError, RejectionReason};

lazy_static! {
    static ref RE_OBJ_HEADER: Regex = Regex::new(r"\d+\s+\d+\s+obj").unwrap();
    static ref RE_STARTXREF: Regex = Regex::new(r"startxref\s+(\d+)").unwrap();
    static ref RE_STREAM: Regex = Regex::new(r"[^d]stream\s").unwrap();
    static ref RE_ENDSTREAM: Regex = Regex::new(r"endstream").unwrap();
    static ref RE_PAGE_MARKER: Regex = Regex::new(r"/Type\s*/Page[^s]").unwrap();
    static ref RE_EMBEDDED_FONT: Regex = Regex::new(r"/Subtype\s*/(TrueType|Type0|CIDFontType[02])").unwrap();
}

/// Non-fatal anomalies found in a document that still loads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureProblem {
    BrokenXref,
    UnbalancedStreams,
    Linearized,
    MissingFontDescriptors,
    MissingEofMarker,
}

/// Category of a structural load failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Protection,
    Corruption,
    UnconventionalStructure,
    UnsupportedFormat,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDetails {
    pub size: usize,
    pub page_count: Option<usize>,
    pub encrypted: bool,
    pub structure_problems: Vec<StructureProblem>,
    pub failure_kind: Option<FailureKind>,
    #[serde(skip)]
    pub rejection: Option<RejectionReason>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub valid: bool,
    pub needs_repair: bool,
    pub message: String,
    pub details: HealthDetails,
}

impl HealthReport {
    fn rejected(size: usize, reason: RejectionReason) -> Self {
        Self {
            valid: false,
            needs_repair: false,
            message: reason.to_string(),
            details: HealthDetails {
                size,
                rejection: Some(reason),
                ..HealthDetails::default()
            },
        }
    }
}

/// Byte-level validity checks that run before any recovery work
#[derive(Debug, Clone, Copy)]
pub struct DocumentHealthValidator {
    max_file_size: usize,
}

impl DocumentHealthValidator {
    pub fn new(max_file_size: usize) -> Self {
        Self { max_file_size }
    }

    /// Validate a file on disk. Only I/O failures are errors.
    pub fn validate_path(&self, path: &Path) -> Result<HealthReport, LabReportError> {
        let bytes = std::fs::read(path).map_err(|e| LabReportError::io(path.display().to_string(), e))?;
        let filename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(self.validate(&Document::new(bytes, filename)))
    }

    pub fn validate(&self, doc: &Document) -> HealthReport {
        let size = doc.len();

        if doc.is_empty() {
            return HealthReport::rejected(size, RejectionReason::EmptyUpload);
        }
        if size > self.max_file_size {
            return HealthReport::rejected(
                size,
                RejectionReason::Oversized {
                    size,
                    limit: self.max_file_size,
                },
            );
        }
        if !doc.has_pdf_signature() {
            return HealthReport::rejected(size, RejectionReason::NotPdf);
        }

        let bytes = doc.bytes();
        let structure_problems = scan_structure_problems(bytes);
        let loaded = std::panic::catch_unwind(|| lopdf::Document::load_mem(bytes));

        match loaded {
            Ok(Ok(pdf)) => {
                let page_count = pdf.get_pages().len();
                let encrypted = pdf.is_encrypted();
                let needs_repair = structure_problems.contains(&StructureProblem::BrokenXref) || page_count == 0;
                HealthReport {
                    valid: true,
                    needs_repair,
                    message: format!("Valid PDF with {} pages", page_count),
                    details: HealthDetails {
                        size,
                        page_count: Some(page_count),
                        encrypted,
                        structure_problems,
                        failure_kind: None,
                        rejection: None,
                    },
                }
            }
            Ok(Err(e)) => self.classify_load_failure(bytes, &e.to_string(), structure_problems),
            Err(_) => self.classify_load_failure(bytes, "parser panicked", structure_problems),
        }
    }

    fn classify_load_failure(&self, bytes: &[u8], error: &str, structure_problems: Vec<StructureProblem>) -> HealthReport {
        let failure_kind = classify_failure(error);
        let recoverable = looks_repairable(bytes);
        log::debug!(
            "Structural load failed ({:?}, repairable: {}): {}",
            failure_kind,
            recoverable,
            error
        );

        let message = if recoverable {
            format!("PDF needs repair ({:?}): {}", failure_kind, error)
        } else {
            format!("PDF structure is unusable ({:?}): {}", failure_kind, error)
        };

        HealthReport {
            valid: recoverable,
            needs_repair: recoverable,
            message,
            details: HealthDetails {
                size: bytes.len(),
                page_count: None,
                encrypted: failure_kind == FailureKind::Protection,
                structure_problems,
                failure_kind: Some(failure_kind),
                rejection: None,
            },
        }
    }
}

/// Map a loader error message onto a failure category
pub fn classify_failure(message: &str) -> FailureKind {
    let message = message.to_lowercase();
    if ["encrypt", "decrypt", "password", "permission"].iter().any(|kw| message.contains(kw)) {
        FailureKind::Protection
    } else if ["xref", "trailer", "offset", "startxref", "eof", "stream", "parse"]
        .iter()
        .any(|kw| message.contains(kw))
    {
        FailureKind::Corruption
    } else if ["header", "version", "unsupported"].iter().any(|kw| message.contains(kw)) {
        FailureKind::UnsupportedFormat
    } else {
        FailureKind::UnconventionalStructure
    }
}

/// Cheap secondary check: objects, a trailer or catalog, and page markers
pub fn looks_repairable(bytes: &[u8]) -> bool {
    let has_objects = RE_OBJ_HEADER.is_match(bytes);
    let has_trailer = contains(bytes, b"trailer") || contains(bytes, b"/Root") || contains(bytes, b"/Catalog");
    let has_pages = RE_PAGE_MARKER.is_match(bytes) || contains(bytes, b"/Pages");
    has_objects && has_trailer && has_pages
}

fn scan_structure_problems(bytes: &[u8]) -> Vec<StructureProblem> {
    let mut problems = Vec::new();

    let xref_ok = RE_STARTXREF
        .captures_iter(bytes)
        .last()
        .and_then(|cap| cap.get(1))
        .and_then(|m| std::str::from_utf8(m.as_bytes()).ok()?.parse::<usize>().ok())
        .is_some_and(|offset| {
            offset < bytes.len() && {
                let at = &bytes[offset..bytes.len().min(offset + 32)];
                at.starts_with(b"xref") || RE_OBJ_HEADER.find(at).is_some_and(|m| m.start() == 0)
            }
        });
    if !xref_ok {
        problems.push(StructureProblem::BrokenXref);
    }

    if RE_STREAM.find_iter(bytes).count() != RE_ENDSTREAM.find_iter(bytes).count() {
        problems.push(StructureProblem::UnbalancedStreams);
    }

    if contains(&bytes[..bytes.len().min(4096)], b"/Linearized") {
        problems.push(StructureProblem::Linearized);
    }

    if RE_EMBEDDED_FONT.is_match(bytes) && !contains(bytes, b"/FontDescriptor") {
        problems.push(StructureProblem::MissingFontDescriptors);
    }

    let tail = &bytes[bytes.len().saturating_sub(1024)..];
    if !contains(tail, b"%%EOF") {
        problems.push(StructureProblem::MissingEofMarker);
    }

    problems
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && memmem::find(haystack, needle).is_some()
}
