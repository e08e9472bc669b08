use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::error::LabReportError;

/// The PDF signature every accepted upload must start with
pub const PDF_SIGNATURE: &[u8] = b"%PDF-";

/// An uploaded PDF. Immutable: every transformation (decrypt, repair, split)
/// produces a new `Document` instead of mutating this one.
#[derive(Debug, Clone)]
pub struct Document {
    bytes: Arc<[u8]>,
    filename: String,
}

impl Document {
    pub fn new(bytes: impl Into<Arc<[u8]>>, filename: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            filename: filename.into(),
        }
    }

    /// Derive a new document from transformed bytes, keeping the original name
    pub fn derive(&self, bytes: Vec<u8>, suffix: &str) -> Self {
        Self::new(bytes, format!("{}#{}", self.filename, suffix))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cheap shared handle for moving into blocking tasks
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn has_pdf_signature(&self) -> bool {
        self.bytes.starts_with(PDF_SIGNATURE)
    }

    /// Bounded prefix decoded as Latin-1, one char per byte
    pub fn latin1_prefix(&self, max_bytes: usize) -> String {
        self.bytes[..self.bytes.len().min(max_bytes)]
            .iter()
            .map(|&b| b as char)
            .collect()
    }
}

/// Where an upload comes from. Resolved once at the entry boundary.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    Path(PathBuf),
    Bytes { data: Vec<u8>, filename: String },
}

impl DocumentSource {
    pub async fn resolve(self) -> Result<Document, LabReportError> {
        match self {
            DocumentSource::Path(path) => {
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(|e| LabReportError::io(path.display().to_string(), e))?;
                let filename = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload.pdf".to_string());
                Ok(Document::new(data, filename))
            }
            DocumentSource::Bytes { data, filename } => Ok(Document::new(data, filename)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PageId {
    Number(usize),
    Label(String),
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageId::Number(n) => write!(f, "{}", n),
            PageId::Label(label) => write!(f, "{}", label),
        }
    }
}

/// One page of recovered text, or a page whose content was lost
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Page {
    Text { id: PageId, text: String },
    /// `index` is the 1-based position in the original document
    Unrecoverable { index: usize },
}

impl Page {
    pub fn numbered(number: usize, text: impl Into<String>) -> Self {
        Page::Text {
            id: PageId::Number(number),
            text: text.into(),
        }
    }

    pub fn labeled(label: impl Into<String>, text: impl Into<String>) -> Self {
        Page::Text {
            id: PageId::Label(label.into()),
            text: text.into(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Page::Text { text, .. } => Some(text),
            Page::Unrecoverable { .. } => None,
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Page::Unrecoverable { .. })
    }
}

/// Ordered pages produced by one successful recovery attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RecoveredText {
    pub pages: Vec<Page>,
}

impl RecoveredText {
    pub fn new(pages: Vec<Page>) -> Self {
        Self { pages }
    }

    /// Character count of the first page that still carries text
    pub fn first_text_len(&self) -> usize {
        self.pages
            .iter()
            .find_map(Page::text)
            .map(|text| text.trim().chars().count())
            .unwrap_or(0)
    }

    /// Usable text: the first page's text exceeds the minimum content threshold
    pub fn is_usable(&self, min_text_length: usize) -> bool {
        self.first_text_len() > min_text_length
    }

    pub fn text_pages(&self) -> impl Iterator<Item = (&PageId, &str)> {
        self.pages.iter().filter_map(|page| match page {
            Page::Text { id, text } => Some((id, text.as_str())),
            Page::Unrecoverable { .. } => None,
        })
    }

    pub fn unrecoverable_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_unrecoverable()).count()
    }

    /// 1-based indices of the pages whose content was lost
    pub fn unrecoverable_pages(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter_map(|page| match page {
                Page::Unrecoverable { index } => Some(*index),
                Page::Text { .. } => None,
            })
            .collect()
    }

    /// Replace the given 1-based page positions with unrecoverable markers
    pub fn mark_unrecoverable(&mut self, indices: &[usize]) {
        for &index in indices {
            if let Some(page) = self.pages.get_mut(index.saturating_sub(1)) {
                *page = Page::Unrecoverable { index };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Split raw extractor output into pages on form-feed boundaries
pub fn pages_from_raw_text(raw_text: &str) -> Vec<Page> {
    let parts: Vec<&str> = raw_text.split('\x0C').collect();
    let parts: Vec<&str> = if parts.len() > 1 {
        // A trailing form feed leaves an empty tail
        let trimmed_len = parts.iter().rposition(|p| !p.trim().is_empty()).map(|i| i + 1).unwrap_or(1);
        parts[..trimmed_len].to_vec()
    } else {
        parts
    };

    parts
        .into_iter()
        .enumerate()
        .map(|(i, text)| Page::numbered(i + 1, text.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_check() {
        assert!(Document::new(b"%PDF-1.7\n".to_vec(), "a.pdf").has_pdf_signature());
        assert!(!Document::new(b"PK\x03\x04".to_vec(), "a.zip").has_pdf_signature());
        assert!(!Document::new(Vec::new(), "empty.pdf").has_pdf_signature());
    }

    #[test]
    fn test_latin1_prefix_maps_every_byte() {
        let doc = Document::new(vec![b'%', 0xE9, b'P'], "x.pdf");
        assert_eq!(doc.latin1_prefix(2), "%\u{e9}");
        assert_eq!(doc.latin1_prefix(100).chars().count(), 3);
    }

    #[test]
    fn test_usable_text_uses_first_text_page() {
        let short = RecoveredText::new(vec![Page::numbered(1, "too short"), Page::numbered(2, "x".repeat(200))]);
        assert!(!short.is_usable(50));

        let long = RecoveredText::new(vec![Page::numbered(1, "a".repeat(51))]);
        assert!(long.is_usable(50));

        let exactly = RecoveredText::new(vec![Page::numbered(1, "a".repeat(50))]);
        assert!(!exactly.is_usable(50));
    }

    #[test]
    fn test_mark_unrecoverable_preserves_page_count() {
        let mut text = RecoveredText::new(vec![
            Page::numbered(1, "one"),
            Page::numbered(2, "two"),
            Page::numbered(3, "three"),
        ]);
        text.mark_unrecoverable(&[2]);

        assert_eq!(text.len(), 3);
        assert_eq!(text.pages[1], Page::Unrecoverable { index: 2 });
        assert_eq!(text.unrecoverable_count(), 1);
        assert_eq!(text.unrecoverable_pages(), vec![2]);
        assert_eq!(text.text_pages().count(), 2);
    }

    #[test]
    fn test_pages_from_raw_text() {
        let pages = pages_from_raw_text("first\x0Csecond\x0C");
        assert_eq!(pages, vec![Page::numbered(1, "first"), Page::numbered(2, "second")]);

        let single = pages_from_raw_text("  only page  ");
        assert_eq!(single, vec![Page::numbered(1, "only page")]);
    }

    #[tokio::test]
    async fn test_resolve_missing_path_is_io_error() {
        let err = DocumentSource::Path(PathBuf::from("/nonexistent/report.pdf"))
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, LabReportError::Io { .. }));
    }
}
