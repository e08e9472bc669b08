//! Byte-level structural repair.
//!
//! Rewrites a damaged file into one `lopdf` can load: the encryption
//! reference is blanked out, object bodies with a dangling `stream` keyword
//! are cut back to their dictionary, and a fresh cross-reference table and
//! trailer are synthesized from an object scan.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use memchr::memmem;
use regex::bytes::Regex;

lazy_static! {
    static ref RE_OBJ_HEADER: Regex = Regex::new(r"(\d+)\s+(\d+)\s+obj\b").unwrap();
    static ref RE_ENCRYPT_REF: Regex = Regex::new(r"/Encrypt\s+\d+\s+\d+\s+R").unwrap();
    static ref RE_CATALOG: Regex = Regex::new(r"/Type\s*/Catalog\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    StrippedEncryption,
    RemovedBrokenStream,
    RebuiltXref,
}

#[derive(Debug, Clone)]
pub struct RepairReport {
    pub bytes: Vec<u8>,
    pub actions: Vec<RepairAction>,
    pub objects: usize,
}

/// Blank out `/Encrypt N G R` references with same-length whitespace so
/// existing offsets stay valid
pub fn strip_encryption(bytes: &[u8]) -> (Vec<u8>, bool) {
    let mut out = bytes.to_vec();
    let mut stripped = false;
    for m in RE_ENCRYPT_REF.find_iter(bytes) {
        out[m.start()..m.end()].fill(b' ');
        stripped = true;
    }
    (out, stripped)
}

struct ObjectSegment {
    number: u32,
    generation: u16,
    start: usize,
    end: usize,
}

/// Scan for `N G obj` headers that are followed by a plausible object start
fn scan_objects(bytes: &[u8]) -> Vec<ObjectSegment> {
    let mut headers: Vec<(u32, u16, usize, usize)> = Vec::new();

    for cap in RE_OBJ_HEADER.captures_iter(bytes) {
        let (Some(full), Some(num), Some(generation)) = (cap.get(0), cap.get(1), cap.get(2)) else {
            continue;
        };
        if full.start() > 0 && !bytes[full.start() - 1].is_ascii_whitespace() {
            continue;
        }
        let Some(number) = parse_ascii::<u32>(num.as_bytes()) else {
            continue;
        };
        let Some(generation) = parse_ascii::<u16>(generation.as_bytes()) else {
            continue;
        };

        let next = bytes[full.end()..].iter().find(|b| !b.is_ascii_whitespace());
        let plausible = next.is_some_and(|b| {
            matches!(b, b'<' | b'[' | b'(' | b'/' | b't' | b'f' | b'n' | b'-' | b'+' | b'.') || b.is_ascii_digit()
        });
        if plausible {
            headers.push((number, generation, full.start(), full.end()));
        }
    }

    let mut segments = Vec::with_capacity(headers.len());
    for (i, &(number, generation, start, body_start)) in headers.iter().enumerate() {
        let limit = headers.get(i + 1).map(|h| h.2).unwrap_or(bytes.len());
        let body = &bytes[body_start..limit];
        // Anything after the last endobj (old xref, trailer) is dropped
        let end = memmem::rfind(body, b"endobj").map(|pos| body_start + pos + b"endobj".len()).unwrap_or(limit);
        segments.push(ObjectSegment {
            number,
            generation,
            start,
            end,
        });
    }
    segments
}

/// Full repair pass. Fails when no objects or no catalog can be found.
pub fn repair_bytes(bytes: &[u8]) -> Result<RepairReport> {
    let mut actions = Vec::new();

    let (stripped, had_encrypt) = strip_encryption(bytes);
    if had_encrypt {
        actions.push(RepairAction::StrippedEncryption);
    }

    let segments = scan_objects(&stripped);
    if segments.is_empty() {
        anyhow::bail!("No object headers found; nothing to rebuild");
    }

    let header_end = segments[0].start;
    let mut out: Vec<u8> = stripped[..header_end].to_vec();
    if !out.starts_with(b"%PDF-") {
        out = b"%PDF-1.4\n".to_vec();
    }
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }

    // Later definitions win, matching incremental-update semantics
    let mut offsets: BTreeMap<u32, (usize, u16)> = BTreeMap::new();
    let mut catalog: Option<(u32, u16)> = None;

    for segment in &segments {
        let body = &stripped[segment.start..segment.end];
        let offset = out.len();

        if has_dangling_stream(body) {
            let cut = memmem::find(body, b"stream").unwrap_or(body.len());
            out.extend_from_slice(&body[..cut]);
            out.extend_from_slice(b"\nendobj");
            actions.push(RepairAction::RemovedBrokenStream);
        } else {
            out.extend_from_slice(body);
            if !body.ends_with(b"endobj") {
                out.extend_from_slice(b"\nendobj");
            }
        }
        out.push(b'\n');

        if RE_CATALOG.is_match(body) {
            catalog = Some((segment.number, segment.generation));
        }
        offsets.insert(segment.number, (offset, segment.generation));
    }

    let (root_num, root_gen) = catalog.context("No /Type /Catalog object found")?;
    let size = offsets.keys().next_back().map(|n| n + 1).unwrap_or(1);

    let xref_offset = out.len();
    let mut table = String::new();
    let _ = write!(table, "xref\n0 {}\n0000000000 65535 f \n", size);
    for number in 1..size {
        match offsets.get(&number) {
            Some((offset, generation)) => {
                let _ = write!(table, "{:010} {:05} n \n", offset, generation);
            }
            None => table.push_str("0000000000 65535 f \n"),
        }
    }
    let _ = write!(
        table,
        "trailer\n<< /Size {} /Root {} {} R >>\nstartxref\n{}\n%%EOF\n",
        size, root_num, root_gen, xref_offset
    );
    out.extend_from_slice(table.as_bytes());
    actions.push(RepairAction::RebuiltXref);

    log::debug!("Rebuilt xref for {} objects, actions: {:?}", offsets.len(), actions);

    Ok(RepairReport {
        bytes: out,
        actions,
        objects: offsets.len(),
    })
}

fn has_dangling_stream(body: &[u8]) -> bool {
    let opens = memmem::find(body, b"stream").is_some_and(|pos| pos == 0 || body[pos - 1] != b'd');
    opens && memmem::find(body, b"endstream").is_none()
}

fn parse_ascii<T: std::str::FromStr>(digits: &[u8]) -> Option<T> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}
