//! Chunked result extraction and document-wide de-duplication.
//!
//! Page text is cut into bounded chunks, each chunk goes through the
//! structured-extraction capability, and the returned lines are merged with a
//! single `SeenExams` accumulator: the first line for a canonical exam key
//! wins, in page-then-chunk order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::capabilities::{with_timeout, AiTextCapability};
use crate::document::RecoveredText;

const EXTRACTION_SYSTEM_PROMPT: &str = "You extract laboratory results from Brazilian lab reports.\n\
Output one line per exam, and nothing else, in exactly this format:\n\
<Exam Name>: <value>[ % / <value2>] | VR: <min> - <max>\n\
Rules:\n\
- Copy numeric values exactly as written. Never round.\n\
- Put *** right after any value outside its reference range.\n\
- Do not write units after numeric values.\n\
- Do not start lines with a hyphen or any bullet.\n\
- No explanations, headers or comments.";

const EXTRACTION_MAX_TOKENS: u32 = 2000;

/// Synonym groups folded onto one canonical key
const SYNONYMS: &[(&str, &[&str])] = &[
    ("tgo", &["tgo", "ast", "aspartato"]),
    ("tgp", &["tgp", "alt", "alanina"]),
    ("ggt", &["gamma", "gama", "ggt"]),
    ("glicose", &["glicose", "glicemia"]),
];

lazy_static! {
    static ref RE_BULLET: Regex = Regex::new(r"^[\s\-\*•·–—>]+").unwrap();
    static ref RE_REFERENCE: Regex = Regex::new(r"(?i)\bVR\s*:\s*(.+)$").unwrap();
    static ref RE_HAS_DIGIT: Regex = Regex::new(r"\d").unwrap();
}

/// One parsed result line
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResult {
    pub raw_exam_name: String,
    pub canonical_key: String,
    pub value_expression: String,
    pub reference_range: String,
    pub is_abnormal: bool,
    /// Bullet-stripped line as it is emitted
    pub line: String,
}

/// Lowercase, then fold known aliases onto one key
pub fn canonical_key(raw_exam_name: &str) -> String {
    let lowered = raw_exam_name.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    for (key, aliases) in SYNONYMS {
        if tokens.iter().any(|t| aliases.contains(t)) {
            return key.to_string();
        }
    }
    tokens.join(" ")
}

pub fn parse_result_line(line: &str) -> Option<ExamResult> {
    let stripped = RE_BULLET.replace(line.trim(), "");
    let stripped = stripped.trim();
    let (name, rest) = stripped.split_once(':')?;
    let name = name.trim();
    let rest = rest.trim();
    if name.is_empty() || rest.is_empty() {
        return None;
    }

    let key = canonical_key(name);
    if key.is_empty() || key.starts_with("paciente") {
        return None;
    }

    let value_expression = rest.split('|').next().unwrap_or("").trim().to_string();
    let reference_range = RE_REFERENCE
        .captures(rest)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    Some(ExamResult {
        raw_exam_name: name.to_string(),
        canonical_key: key,
        is_abnormal: value_expression.contains("***"),
        value_expression,
        reference_range,
        line: format!("{}: {}", name, rest),
    })
}

/// Canonical keys already emitted for one summary
#[derive(Debug, Default)]
pub struct SeenExams {
    keys: HashSet<String>,
}

impl SeenExams {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when this is the first occurrence of the exam
    pub fn admit(&mut self, result: &ExamResult) -> bool {
        self.keys.insert(result.canonical_key.clone())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Keep the first line per canonical key, in encounter order
pub fn merge_lines<I, S>(lines: I, seen: &mut SeenExams) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| parse_result_line(line.as_ref()))
        .filter(|result| seen.admit(result))
        .map(|result| result.line)
        .collect()
}

/// Split text into chunks of at most `max_chars`, preferring line breaks
/// and then word boundaries
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.lines() {
        let mut rest = line;
        loop {
            let rest_len = rest.chars().count();
            let needed = rest_len + usize::from(current_len > 0);
            if current_len + needed <= max_chars {
                if current_len > 0 {
                    current.push('\n');
                }
                current.push_str(rest);
                current_len += needed;
                break;
            }
            if current_len > 0 {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
                continue;
            }
            // A single line longer than a chunk
            let piece = break_at_word_boundary(rest, max_chars);
            chunks.push(piece.trim_end().to_string());
            rest = rest[piece.len()..].trim_start();
            if rest.is_empty() {
                break;
            }
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks.retain(|c| !c.trim().is_empty());
    chunks
}

fn break_at_word_boundary(text: &str, max_chars: usize) -> &str {
    let end = text.char_indices().nth(max_chars).map(|(i, _)| i).unwrap_or(text.len());
    let truncated = &text[..end];
    if end < text.len() {
        if let Some(space) = truncated.rfind(' ') {
            if truncated[..space].chars().count() >= (max_chars / 10).max(1) {
                return &truncated[..space];
            }
        }
    }
    truncated
}

/// Final artifact: header plus de-duplicated result lines
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub patient_name: String,
    pub ordered_result_lines: Vec<String>,
}

impl Summary {
    pub fn body(&self) -> String {
        format!("Paciente: {}\n\n{}", self.patient_name, self.ordered_result_lines.join("\n"))
    }
}

pub struct ResultSummarizer {
    ai: Option<Arc<dyn AiTextCapability>>,
    chunk_chars: usize,
    concurrency: usize,
    timeout: Duration,
}

impl ResultSummarizer {
    pub fn new(ai: Option<Arc<dyn AiTextCapability>>, chunk_chars: usize, concurrency: usize, timeout: Duration) -> Self {
        Self {
            ai,
            chunk_chars,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    pub async fn summarize(&self, pages: &RecoveredText, patient_name: &str) -> Summary {
        let chunks: Vec<String> = pages
            .text_pages()
            .flat_map(|(_, text)| chunk_text(text, self.chunk_chars))
            .collect();
        log::info!("Summarizing {} chunk(s) from {} page(s)", chunks.len(), pages.len());

        // `buffered` keeps chunk order while running calls concurrently
        let per_chunk: Vec<Vec<String>> = stream::iter(chunks.into_iter().enumerate())
            .map(|(index, chunk)| async move { self.extract_chunk(index, &chunk).await })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut seen = SeenExams::new();
        let mut ordered_result_lines = Vec::new();
        for lines in per_chunk {
            ordered_result_lines.extend(merge_lines(lines, &mut seen));
        }

        Summary {
            patient_name: patient_name.to_string(),
            ordered_result_lines,
        }
    }

    async fn extract_chunk(&self, index: usize, chunk: &str) -> Vec<String> {
        let Some(ai) = &self.ai else {
            return local_result_lines(chunk);
        };

        let user = format!("Extract every laboratory result from this text:\n\n{}", chunk);
        match with_timeout(
            self.timeout,
            "result extraction",
            ai.complete(EXTRACTION_SYSTEM_PROMPT, &user, EXTRACTION_MAX_TOKENS, 0.0),
        )
        .await
        {
            Ok(reply) => reply.lines().map(str::to_string).collect(),
            Err(e) => {
                log::warn!("Chunk {} extraction failed, contributing no lines: {:#}", index, e);
                Vec::new()
            }
        }
    }
}

/// Without an AI capability, keep lines that already carry a value
fn local_result_lines(chunk: &str) -> Vec<String> {
    chunk
        .lines()
        .filter(|line| {
            line.split_once(':')
                .is_some_and(|(name, value)| !name.trim().is_empty() && RE_HAS_DIGIT.is_match(value))
        })
        .map(|line| line.trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Page;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replies with the next canned response; `None` entries fail
    struct ScriptedAi {
        replies: Vec<Option<&'static str>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AiTextCapability for ScriptedAi {
        async fn complete(&self, _system: &str, _user: &str, _max_tokens: u32, _temperature: f32) -> anyhow::Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.replies.get(call).copied().flatten() {
                Some(reply) => Ok(reply.to_string()),
                None => anyhow::bail!("chunk rejected"),
            }
        }
    }

    fn summarizer(replies: Vec<Option<&'static str>>) -> ResultSummarizer {
        let ai = ScriptedAi {
            replies,
            calls: AtomicUsize::new(0),
        };
        ResultSummarizer::new(Some(Arc::new(ai)), 12_000, 1, Duration::from_secs(5))
    }

    #[test]
    fn test_canonical_key_folds_synonyms() {
        assert_eq!(canonical_key("AST"), "tgo");
        assert_eq!(canonical_key("TGO"), "tgo");
        assert_eq!(canonical_key("Aspartato aminotransferase"), "tgo");
        assert_eq!(canonical_key("ALT (TGP)"), "tgp");
        assert_eq!(canonical_key("Gama GT"), "ggt");
        assert_eq!(canonical_key("Glicemia de jejum"), "glicose");
        assert_eq!(canonical_key("Hemoglobina  Glicada"), "hemoglobina glicada");
    }

    #[test]
    fn test_parse_result_line() {
        let result = parse_result_line("- Glicose: 130*** | VR: 70 - 99").unwrap();
        assert_eq!(result.raw_exam_name, "Glicose");
        assert_eq!(result.canonical_key, "glicose");
        assert_eq!(result.value_expression, "130***");
        assert_eq!(result.reference_range, "70 - 99");
        assert!(result.is_abnormal);
        assert_eq!(result.line, "Glicose: 130*** | VR: 70 - 99");

        assert!(parse_result_line("Paciente: JOAO DA SILVA").is_none());
        assert!(parse_result_line("no colon here").is_none());
        assert!(parse_result_line("Glicose:").is_none());
    }

    #[test]
    fn test_merge_preserves_order_and_first_wins() {
        let mut seen = SeenExams::new();
        let lines = ["A1: 1 | VR: 0 - 2", "B: 2 | VR: 0 - 3", "A1: 9 | VR: 0 - 2", "C: 3 | VR: 1 - 4"];
        let merged = merge_lines(lines, &mut seen);
        assert_eq!(merged, vec!["A1: 1 | VR: 0 - 2", "B: 2 | VR: 0 - 3", "C: 3 | VR: 1 - 4"]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let lines = ["TGO: 32 | VR: 0 - 40", "AST: 32 | VR: 0 - 40", "Ureia: 30 | VR: 15 - 45"];
        let once = merge_lines(lines, &mut SeenExams::new());
        let twice = merge_lines(&once, &mut SeenExams::new());
        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn test_chunk_text_respects_limit_and_lines() {
        let text = "line one\nline two\nline three";
        let chunks = chunk_text(text, 18);
        assert_eq!(chunks, vec!["line one\nline two", "line three"]);

        let long = "word ".repeat(30);
        let chunks = chunk_text(&long, 40);
        assert!(chunks.iter().all(|c| c.chars().count() <= 40));
        assert_eq!(chunks.join(" ").split_whitespace().count(), 30);
    }

    #[tokio::test]
    async fn test_synonyms_across_pages_collapse() {
        let pages = RecoveredText::new(vec![Page::numbered(1, "page one"), Page::numbered(2, "page two")]);
        let s = summarizer(vec![Some("AST: 32 | VR: 0 - 40"), Some("TGO: 32 | VR: 0 - 40\nUreia: 30 | VR: 15 - 45")]);
        let summary = s.summarize(&pages, "ANA LIMA").await;
        assert_eq!(summary.ordered_result_lines, vec!["AST: 32 | VR: 0 - 40", "Ureia: 30 | VR: 15 - 45"]);
    }

    #[tokio::test]
    async fn test_failed_chunk_contributes_nothing() {
        let pages = RecoveredText::new(vec![
            Page::numbered(1, "one"),
            Page::numbered(2, "two"),
            Page::numbered(3, "three"),
        ]);
        let s = summarizer(vec![Some("Glicose: 95 | VR: 70 - 99"), None, Some("Ureia: 30 | VR: 15 - 45")]);
        let summary = s.summarize(&pages, "ANA LIMA").await;
        assert_eq!(summary.ordered_result_lines.len(), 2);
        assert_eq!(summary.body(), "Paciente: ANA LIMA\n\nGlicose: 95 | VR: 70 - 99\nUreia: 30 | VR: 15 - 45");
    }

    #[tokio::test]
    async fn test_unrecoverable_pages_are_skipped() {
        let pages = RecoveredText::new(vec![Page::Unrecoverable { index: 1 }, Page::numbered(2, "two")]);
        let s = summarizer(vec![Some("Glicose: 95 | VR: 70 - 99")]);
        let summary = s.summarize(&pages, "X Y").await;
        assert_eq!(summary.ordered_result_lines, vec!["Glicose: 95 | VR: 70 - 99"]);
    }

    #[tokio::test]
    async fn test_local_extraction_without_ai() {
        let pages = RecoveredText::new(vec![Page::numbered(
            1,
            "Paciente: JOAO DA SILVA\nGlicose: 95 | VR: 70 - 99\nObservacao: amostra hemolisada\nGlicemia: 96 | VR: 70 - 99",
        )]);
        let s = ResultSummarizer::new(None, 12_000, 2, Duration::from_secs(5));
        let summary = s.summarize(&pages, "JOAO DA SILVA").await;
        assert_eq!(summary.ordered_result_lines, vec!["Glicose: 95 | VR: 70 - 99"]);
    }
}
