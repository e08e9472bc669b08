//! Classification of PDF encryption and permission restrictions.
//!
//! Only a bounded prefix of the byte stream is scanned as Latin-1 text. The
//! marker counting and `/P` bit decoding are heuristics: documents with
//! unusual layouts can be misclassified in either direction, and callers
//! treat the result as a hint for choosing recovery strategies.

use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::document::Document;

lazy_static! {
    static ref RE_PERMISSIONS: Regex = Regex::new(r"/P\s*(-?\d+)").unwrap();
    static ref RE_ENCRYPT_REF: Regex = Regex::new(r"/Encrypt\s+\d+\s+\d+\s+R").unwrap();
}

/// Markers whose combined presence suggests an encryption dictionary
const ENCRYPTION_MARKERS: &[&str] = &["/Encrypt", "/Standard", "/StdCF", "/Crypt", "/R ", "/O ", "/U ", "/P "];

/// Marker count at or above which a document is considered encrypted
const ENCRYPTION_MARKER_THRESHOLD: usize = 3;

/// Keywords in loader error messages that point at protection
const ENCRYPTION_ERROR_KEYWORDS: &[&str] = &["encrypt", "decrypt", "password", "security handler"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    Print,
    Modify,
    Copy,
    Annotate,
    FillForms,
    Accessibility,
    Assemble,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Print,
        Capability::Modify,
        Capability::Copy,
        Capability::Annotate,
        Capability::FillForms,
        Capability::Accessibility,
        Capability::Assemble,
    ];

    /// Zero-based bit position within the `/P` integer
    pub fn bit(self) -> u32 {
        match self {
            Capability::Print => 2,
            Capability::Modify => 3,
            Capability::Copy => 4,
            Capability::Annotate => 5,
            Capability::FillForms => 8,
            Capability::Accessibility => 9,
            Capability::Assemble => 10,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Capability::Print => "print",
            Capability::Modify => "modify",
            Capability::Copy => "copy",
            Capability::Annotate => "annotate",
            Capability::FillForms => "fill forms",
            Capability::Accessibility => "accessibility",
            Capability::Assemble => "assemble",
        }
    }
}

const HIGH_QUALITY_PRINT_BIT: u32 = 11;

/// Decoded `/P` permission integer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    bits: i32,
}

impl Permissions {
    pub fn from_bits(bits: i32) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> i32 {
        self.bits
    }

    pub fn allows(&self, capability: Capability) -> bool {
        (self.bits & (1 << capability.bit())) != 0
    }

    pub fn allows_high_quality_print(&self) -> bool {
        (self.bits & (1 << HIGH_QUALITY_PRINT_BIT)) != 0
    }

    pub fn denied(&self) -> BTreeSet<Capability> {
        Capability::ALL.into_iter().filter(|c| !self.allows(*c)).collect()
    }

    /// Print allowed, every other capability denied: the usual lab-report lock
    pub fn is_print_only(&self) -> bool {
        self.allows(Capability::Print)
            && Capability::ALL
                .into_iter()
                .filter(|c| *c != Capability::Print)
                .all(|c| !self.allows(c))
    }
}

/// Read-only classification of a document's protection state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionProfile {
    pub is_protected: bool,
    pub is_encrypted: bool,
    pub permission_bitmap: Option<i32>,
    pub denied_capabilities: BTreeSet<Capability>,
    pub allows_high_quality_print: bool,
    pub protection_level: usize,
    pub is_known_pattern: bool,
    pub description: String,
}

impl ProtectionProfile {
    pub fn unprotected() -> Self {
        Self {
            is_protected: false,
            is_encrypted: false,
            permission_bitmap: None,
            denied_capabilities: BTreeSet::new(),
            allows_high_quality_print: true,
            protection_level: 0,
            is_known_pattern: false,
            description: "No protection detected".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProtectionAnalyzer {
    scan_bytes: usize,
}

impl ProtectionAnalyzer {
    pub fn new(scan_bytes: usize) -> Self {
        Self { scan_bytes }
    }

    /// Extract the permission integer from the `/P` marker, if any
    pub fn permission_value(prefix: &str) -> Option<i32> {
        RE_PERMISSIONS
            .captures_iter(prefix)
            .find_map(|cap| cap.get(1).and_then(|m| m.as_str().parse::<i64>().ok()))
            // Writers emit both signed and unsigned 32-bit forms
            .map(|value| value as i32)
    }

    /// Number of distinct encryption-related markers in the prefix
    pub fn encryption_marker_count(prefix: &str) -> usize {
        ENCRYPTION_MARKERS.iter().filter(|marker| prefix.contains(*marker)).count()
    }

    pub fn detect_protection(&self, doc: &Document) -> ProtectionProfile {
        let prefix = doc.latin1_prefix(self.scan_bytes);
        let is_encrypted = self.is_encrypted_with_prefix(doc, &prefix);

        let Some(bits) = Self::permission_value(&prefix) else {
            let mut profile = ProtectionProfile::unprotected();
            if is_encrypted {
                profile.is_protected = true;
                profile.is_encrypted = true;
                profile.description = "Encrypted document without a readable permission value".to_string();
            }
            return profile;
        };

        let permissions = Permissions::from_bits(bits);
        let denied = permissions.denied();
        let is_known_pattern = permissions.is_print_only();
        let is_protected = bits < 0 || RE_ENCRYPT_REF.is_match(&prefix) || is_encrypted;

        let description = if is_known_pattern {
            "Print-only protection: copying, editing, annotation, forms, accessibility and assembly are blocked; \
             text can usually be recovered by rendering (OCR) or by removing the permission lock"
                .to_string()
        } else if denied.is_empty() {
            "Permission value present but no capabilities are denied".to_string()
        } else {
            let labels: Vec<&str> = denied.iter().map(|c| c.label()).collect();
            format!("Restricted permissions (P={}): denied {}", bits, labels.join(", "))
        };

        ProtectionProfile {
            is_protected,
            is_encrypted,
            permission_bitmap: Some(bits),
            protection_level: denied.len(),
            denied_capabilities: denied,
            allows_high_quality_print: permissions.allows_high_quality_print(),
            is_known_pattern,
            description,
        }
    }

    pub fn is_encrypted(&self, doc: &Document) -> bool {
        let prefix = doc.latin1_prefix(self.scan_bytes);
        self.is_encrypted_with_prefix(doc, &prefix)
    }

    fn is_encrypted_with_prefix(&self, doc: &Document, prefix: &str) -> bool {
        if Self::permission_value(prefix).is_some_and(|bits| bits < 0) {
            return true;
        }

        let markers = Self::encryption_marker_count(prefix);
        if markers >= ENCRYPTION_MARKER_THRESHOLD {
            log::debug!("{} encryption markers found in prefix of {}", markers, doc.filename());
            return true;
        }

        // Fall back to a full tolerant load
        let bytes = doc.bytes();
        let loaded = std::panic::catch_unwind(|| lopdf::Document::load_mem(bytes));
        match loaded {
            Ok(Ok(pdf)) => pdf.is_encrypted(),
            Ok(Err(e)) => {
                let message = e.to_string().to_lowercase();
                ENCRYPTION_ERROR_KEYWORDS.iter().any(|kw| message.contains(kw))
            }
            // Permissive bias: keep processing rather than abort
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Document {
        Document::new(text.as_bytes().to_vec(), "test.pdf")
    }

    #[test]
    fn test_permission_value_parsing() {
        assert_eq!(ProtectionAnalyzer::permission_value("<< /P -3844 /R 3 >>"), Some(-3844));
        assert_eq!(ProtectionAnalyzer::permission_value("<< /P 4 >>"), Some(4));
        assert_eq!(ProtectionAnalyzer::permission_value("<< /P 4294963452 >>"), Some(-3844));
        assert_eq!(ProtectionAnalyzer::permission_value("<< /Pages 2 0 R >>"), None);
    }

    #[test]
    fn test_negative_permission_is_encrypted() {
        let analyzer = ProtectionAnalyzer::new(20_000);
        let doc = doc("%PDF-1.4\n1 0 obj << /P -3844 >> endobj");
        assert!(analyzer.is_encrypted(&doc));

        let profile = analyzer.detect_protection(&doc);
        assert!(profile.is_protected);
        assert!(profile.is_encrypted);
        assert_eq!(profile.permission_bitmap, Some(-3844));
    }

    #[test]
    fn test_p4_alone_allows_print_and_is_not_encrypted() {
        let analyzer = ProtectionAnalyzer::new(20_000);
        let doc = doc("%PDF-1.4\n1 0 obj << /P 4 >> endobj");
        assert!(!analyzer.is_encrypted(&doc));

        let profile = analyzer.detect_protection(&doc);
        assert!(!profile.denied_capabilities.contains(&Capability::Print));
        assert!(profile.denied_capabilities.contains(&Capability::Copy));
        assert!(profile.is_known_pattern);
        assert!(!profile.is_encrypted);
        assert!(!profile.is_protected);
        assert_eq!(profile.protection_level, 6);
    }

    #[test]
    fn test_marker_count_heuristic() {
        let analyzer = ProtectionAnalyzer::new(20_000);
        let doc = doc("%PDF-1.4\n<< /Filter /Standard /R 3 /O (x) /U (y) /P 4 >>");
        assert!(ProtectionAnalyzer::encryption_marker_count(&doc.latin1_prefix(20_000)) >= 3);
        assert!(analyzer.is_encrypted(&doc));
    }

    #[test]
    fn test_markers_beyond_scan_window_are_ignored() {
        let mut text = "%PDF-1.4\n".to_string();
        text.push_str(&" ".repeat(100));
        text.push_str("/P -1 /Encrypt /Standard /StdCF");
        let analyzer = ProtectionAnalyzer::new(50);
        assert_eq!(analyzer.detect_protection(&doc(&text)).permission_bitmap, None);
    }

    #[test]
    fn test_permission_bit_decoding() {
        let all = Permissions::from_bits(-1);
        assert!(all.denied().is_empty());
        assert!(!all.is_print_only());

        // -3844: print, modify, copy and annotate allowed; bits 8-11 cleared
        let lab = Permissions::from_bits(-3844);
        let denied = lab.denied();
        assert!(denied.contains(&Capability::FillForms));
        assert!(denied.contains(&Capability::Assemble));
        assert!(!denied.contains(&Capability::Copy));
        assert!(!lab.allows_high_quality_print());
    }

    #[test]
    fn test_unparsable_document_defaults_to_not_encrypted() {
        let analyzer = ProtectionAnalyzer::new(20_000);
        assert!(!analyzer.is_encrypted(&doc("%PDF-1.4 garbage without structure")));
    }
}
