//! Page-level document surgery on top of `lopdf`.
//!
//! Every helper takes bytes and returns new bytes; nothing here touches the
//! original buffer. All functions are blocking and are expected to run inside
//! `tokio::task::spawn_blocking`.

use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::{Context, Result};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Object, ObjectId, Stream};

/// Text drawn on a placeholder page
pub fn placeholder_text(page_number: usize) -> String {
    format!("[page {} unrecoverable]", page_number)
}

/// Result of rebuilding a document page by page
#[derive(Debug, Clone)]
pub struct SurgeryOutcome {
    pub bytes: Vec<u8>,
    pub copied: usize,
    /// 1-based page numbers that were replaced by placeholders
    pub error_pages: Vec<usize>,
}

impl SurgeryOutcome {
    pub fn page_count(&self) -> usize {
        self.copied + self.error_pages.len()
    }
}

/// A contiguous page range cut out of a larger document
#[derive(Debug, Clone)]
pub struct DocumentPart {
    pub first_page: usize,
    pub last_page: usize,
    pub bytes: Vec<u8>,
}

impl DocumentPart {
    pub fn label(&self) -> String {
        if self.first_page == self.last_page {
            format!("{}", self.first_page)
        } else {
            format!("{}-{}", self.first_page, self.last_page)
        }
    }
}

/// Load without aborting on parser panics
pub fn load_tolerant(bytes: &[u8]) -> Result<lopdf::Document> {
    match catch_unwind(|| lopdf::Document::load_mem(bytes)) {
        Ok(loaded) => loaded.context("Failed to load PDF structure"),
        Err(_) => anyhow::bail!("PDF parser panicked while loading document"),
    }
}

pub fn page_count(bytes: &[u8]) -> Result<usize> {
    Ok(load_tolerant(bytes)?.get_pages().len())
}

/// Try each password in order on an encrypted document.
///
/// Returns the index of the password that worked, or `None` when the
/// document was not encrypted or no password matched. In the latter case the
/// document is returned unchanged so the caller can still strip the lock.
pub fn try_passwords(pdf: &mut lopdf::Document, passwords: &[String]) -> Option<usize> {
    if !pdf.is_encrypted() {
        return None;
    }

    for (index, password) in passwords.iter().enumerate() {
        let mut candidate = pdf.clone();
        match catch_unwind(AssertUnwindSafe(|| candidate.decrypt(password.as_str()))) {
            Ok(Ok(())) => {
                log::debug!("Document decrypted with password #{}", index);
                *pdf = candidate;
                return Some(index);
            }
            Ok(Err(e)) => log::debug!("Password #{} rejected: {}", index, e),
            Err(_) => log::debug!("Decryption panicked for password #{}", index),
        }
    }
    None
}

/// Rebuild a document keeping every page that still decodes and replacing
/// the rest with an explicit placeholder page. Encryption entries are dropped.
///
/// Fails when no page at all could be kept.
pub fn rebuild_pages(mut pdf: lopdf::Document) -> Result<SurgeryOutcome> {
    pdf.trailer.remove(b"Encrypt");

    let pages = pdf.get_pages();
    if pages.is_empty() {
        anyhow::bail!("Document has no pages to copy");
    }

    let mut broken: Vec<(usize, ObjectId)> = Vec::new();
    for (&number, &page_id) in &pages {
        if !page_is_readable(&pdf, page_id) {
            broken.push((number as usize, page_id));
        }
    }

    let copied = pages.len() - broken.len();
    if copied == 0 {
        anyhow::bail!("None of the {} pages could be copied", pages.len());
    }

    if !broken.is_empty() {
        let font_id = pdf.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        for &(number, page_id) in &broken {
            log::warn!("Page {} is unreadable, inserting placeholder", number);
            replace_with_placeholder(&mut pdf, page_id, font_id, number)?;
        }
    }

    let bytes = save(&mut pdf)?;
    Ok(SurgeryOutcome {
        bytes,
        copied,
        error_pages: broken.into_iter().map(|(number, _)| number).collect(),
    })
}

fn page_is_readable(pdf: &lopdf::Document, page_id: ObjectId) -> bool {
    let check = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        pdf.get_dictionary(page_id).context("page dictionary")?;
        for stream_id in pdf.get_page_contents(page_id) {
            pdf.get_object(stream_id)
                .and_then(Object::as_stream)
                .with_context(|| format!("content stream {:?}", stream_id))?;
        }
        let raw = pdf.get_page_content(page_id).context("page content")?;
        Content::decode(&raw).context("content stream")?;
        Ok(())
    }));
    matches!(check, Ok(Ok(())))
}

fn replace_with_placeholder(pdf: &mut lopdf::Document, page_id: ObjectId, font_id: ObjectId, number: usize) -> Result<()> {
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 14.into()]),
            Operation::new("Td", vec![72.into(), 720.into()]),
            Operation::new("Tj", vec![Object::string_literal(placeholder_text(number))]),
            Operation::new("ET", vec![]),
        ],
    };
    let encoded = content.encode().context("Failed to encode placeholder content")?;
    let stream_id = pdf.add_object(Stream::new(dictionary! {}, encoded));

    let page = pdf
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .with_context(|| format!("Page {} dictionary is not editable", number))?;
    page.set("Contents", stream_id);
    page.set("Resources", dictionary! { "Font" => dictionary! { "F1" => font_id } });
    Ok(())
}

/// Cut the document into groups of `pages_per_part` pages.
///
/// A part that fails to serialize is skipped; only a load failure of the
/// whole document is an error.
pub fn split_into_parts(bytes: &[u8], pages_per_part: usize) -> Result<Vec<DocumentPart>> {
    let pdf = load_tolerant(bytes)?;
    let total = pdf.get_pages().len();
    if total == 0 {
        anyhow::bail!("Document has no pages to split");
    }

    let per_part = pages_per_part.max(1);
    let mut parts = Vec::new();

    for first in (1..=total).step_by(per_part) {
        let last = (first + per_part - 1).min(total);
        match extract_range(&pdf, total, first, last) {
            Ok(part_bytes) => parts.push(DocumentPart {
                first_page: first,
                last_page: last,
                bytes: part_bytes,
            }),
            Err(e) => log::warn!("Skipping pages {}-{}: {:#}", first, last, e),
        }
    }

    Ok(parts)
}

fn extract_range(pdf: &lopdf::Document, total: usize, first: usize, last: usize) -> Result<Vec<u8>> {
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<Vec<u8>> {
        let mut part = pdf.clone();
        part.trailer.remove(b"Encrypt");
        let remove: Vec<u32> = (1..=total)
            .filter(|n| *n < first || *n > last)
            .map(|n| n as u32)
            .collect();
        part.delete_pages(&remove);
        part.prune_objects();
        part.renumber_objects();
        save(&mut part)
    }));
    match outcome {
        Ok(result) => result,
        Err(_) => anyhow::bail!("PDF writer panicked on pages {}-{}", first, last),
    }
}

/// Keep only the pages that reload on their own as single-page documents.
///
/// Fails only when zero pages survive.
pub fn reassemble_reloadable(bytes: &[u8]) -> Result<SurgeryOutcome> {
    let pdf = load_tolerant(bytes)?;
    let total = pdf.get_pages().len();
    let singles = split_into_parts(bytes, 1)?;

    let survivors: Vec<usize> = singles
        .iter()
        .filter(|part| load_tolerant(&part.bytes).is_ok_and(|p| p.get_pages().len() == 1))
        .map(|part| part.first_page)
        .collect();

    if survivors.is_empty() {
        anyhow::bail!("No page of {} reloads independently", total);
    }

    let lost: Vec<usize> = (1..=total).filter(|n| !survivors.contains(n)).collect();
    let mut rebuilt = pdf;
    rebuilt.trailer.remove(b"Encrypt");
    if !lost.is_empty() {
        let remove: Vec<u32> = lost.iter().map(|n| *n as u32).collect();
        rebuilt.delete_pages(&remove);
        rebuilt.prune_objects();
        rebuilt.renumber_objects();
    }

    Ok(SurgeryOutcome {
        bytes: save(&mut rebuilt)?,
        copied: survivors.len(),
        error_pages: lost,
    })
}

/// Re-save with object streams compressed, used to shrink oversized OCR parts
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut pdf = load_tolerant(bytes)?;
    pdf.prune_objects();
    pdf.compress();
    save(&mut pdf)
}

fn save(pdf: &mut lopdf::Document) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    pdf.save_to(&mut out).context("Failed to serialize PDF")?;
    Ok(out)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};

    /// Build a simple text PDF, one page per entry, one text line per `\n`
    pub fn text_pdf(pages: &[&str]) -> lopdf::Document {
        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in pages {
            let mut operations = Vec::new();
            for (i, line) in text.lines().enumerate() {
                operations.push(Operation::new("BT", vec![]));
                operations.push(Operation::new("Tf", vec!["F1".into(), 10.into()]));
                operations.push(Operation::new("Td", vec![50.into(), (780 - 14 * i as i64).into()]));
                operations.push(Operation::new("Tj", vec![Object::string_literal(line)]));
                operations.push(Operation::new("ET", vec![]));
            }
            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    pub fn text_pdf_bytes(pages: &[&str]) -> Vec<u8> {
        let mut doc = text_pdf(pages);
        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_split_into_parts_covers_every_page() {
        let bytes = text_pdf_bytes(&["one", "two", "three", "four", "five", "six", "seven"]);
        let parts = split_into_parts(&bytes, 3).unwrap();

        let ranges: Vec<(usize, usize)> = parts.iter().map(|p| (p.first_page, p.last_page)).collect();
        assert_eq!(ranges, vec![(1, 3), (4, 6), (7, 7)]);
        assert_eq!(page_count(&parts[0].bytes).unwrap(), 3);
        assert_eq!(page_count(&parts[2].bytes).unwrap(), 1);
        assert_eq!(parts[2].label(), "7");
        assert_eq!(parts[0].label(), "1-3");
    }

    #[test]
    fn test_rebuild_keeps_readable_pages() {
        let pdf = text_pdf(&["first page", "second page"]);
        let outcome = rebuild_pages(pdf).unwrap();
        assert_eq!(outcome.copied, 2);
        assert!(outcome.error_pages.is_empty());
        assert_eq!(page_count(&outcome.bytes).unwrap(), 2);
    }

    #[test]
    fn test_rebuild_replaces_broken_page_with_placeholder() {
        let mut pdf = text_pdf(&["good page", "bad page"]);
        let pages = pdf.get_pages();
        let bad_id = pages[&2];
        pdf.get_object_mut(bad_id)
            .and_then(Object::as_dict_mut)
            .unwrap()
            .set("Contents", Object::Reference((9999, 0)));

        let outcome = rebuild_pages(pdf).unwrap();
        assert_eq!(outcome.copied, 1);
        assert_eq!(outcome.error_pages, vec![2]);
        assert_eq!(outcome.page_count(), 2);

        let rebuilt = load_tolerant(&outcome.bytes).unwrap();
        assert_eq!(rebuilt.get_pages().len(), 2);
        let text = rebuilt.extract_text(&[2]).unwrap();
        assert!(text.contains("unrecoverable"), "{}", text);
    }

    #[test]
    fn test_reassemble_keeps_all_healthy_pages() {
        let bytes = text_pdf_bytes(&["a", "b", "c"]);
        let outcome = reassemble_reloadable(&bytes).unwrap();
        assert_eq!(outcome.copied, 3);
        assert!(outcome.error_pages.is_empty());
    }

    #[test]
    fn test_try_passwords_on_plain_document() {
        let mut pdf = text_pdf(&["plain"]);
        assert_eq!(try_passwords(&mut pdf, &["".to_string()]), None);
    }

    #[test]
    fn test_load_tolerant_rejects_garbage() {
        assert!(load_tolerant(b"%PDF-1.4 nothing here").is_err());
    }
}
