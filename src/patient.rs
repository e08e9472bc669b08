use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use crate::capabilities::{with_timeout, AiTextCapability, OcrEngine};
use crate::document::{Document, RecoveredText};
use crate::error::NameNotFound;
use crate::temp_resources::TempResourceManager;
use crate::text_extraction::TextExtractionAdapter;

pub const DEFAULT_PATIENT_NAME: &str = "patient name not identified";

/// Reply the AI capability gives when the text has no patient name
pub const NOT_FOUND_SENTINEL: &str = "NAO_ENCONTRADO";

const NAME_SYSTEM_PROMPT: &str = "You read the first part of a Brazilian laboratory report and return the \
patient's full name exactly as written. Reply with the name only, no label and no punctuation. \
If the text contains no patient name, reply with NAO_ENCONTRADO.";

lazy_static! {
    /// Label patterns, most specific first
    static ref NAME_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i:nome\s+do\s+paciente)\s*:\s*([^\r\n]+)").unwrap(),
        Regex::new(r"(?i:paciente)\s*:\s*([^\r\n]+)").unwrap(),
        Regex::new(r"(?i:paciente)\s+([A-ZÀ-Ý][A-Za-zÀ-ÿ'.]+(?:[ ]+[A-ZÀ-Ý][A-Za-zÀ-ÿ'.]*)+)").unwrap(),
        Regex::new(r"(?i:\bnome)\s*:\s*([^\r\n]+)").unwrap(),
    ];
    /// Field labels that often follow the name on the same line
    static ref TRAILING_FIELD: Regex = Regex::new(
        r"(?i)\s+(data|dt\.?|idade|sexo|cpf|rg|nasc\w*|d\.?n\.?|m[eé]dico|dr\.?|conv[eê]nio|prontu[aá]rio|c[oó]digo|registro|pedido|os)\b.*$"
    )
    .unwrap();
    static ref WIDE_GAP: Regex = Regex::new(r"\s{2,}.*$").unwrap();
}

/// Where an OCR retry for the name can come from
pub struct OcrNameSource<'a> {
    pub adapter: &'a TextExtractionAdapter,
    pub engine: &'a dyn OcrEngine,
    pub doc: &'a Document,
    pub temp: &'a mut TempResourceManager,
}

pub struct PatientIdentifier {
    scan_chars: usize,
    ai: Option<Arc<dyn AiTextCapability>>,
    timeout: Duration,
}

impl PatientIdentifier {
    pub fn new(scan_chars: usize, ai: Option<Arc<dyn AiTextCapability>>, timeout: Duration) -> Self {
        Self { scan_chars, ai, timeout }
    }

    /// Pattern match first, AI second
    pub async fn identify(&self, pages: &RecoveredText) -> Result<String, NameNotFound> {
        let Some((_, text)) = pages.text_pages().next() else {
            return Err(NameNotFound("no extractable text".to_string()));
        };
        let prefix: String = text.chars().take(self.scan_chars).collect();

        if let Some(name) = match_name_patterns(&prefix) {
            log::debug!("Patient name matched by label pattern ({} chars)", name.chars().count());
            return Ok(name);
        }

        self.identify_with_ai(&prefix).await
    }

    async fn identify_with_ai(&self, prefix: &str) -> Result<String, NameNotFound> {
        let ai = self
            .ai
            .as_ref()
            .ok_or_else(|| NameNotFound("no label match and no AI capability".to_string()))?;
        if prefix.trim().is_empty() {
            return Err(NameNotFound("empty text".to_string()));
        }

        let reply = with_timeout(self.timeout, "name extraction", ai.complete(NAME_SYSTEM_PROMPT, prefix, 50, 0.0))
            .await
            .map_err(|e| NameNotFound(format!("AI call failed: {:#}", e)))?;
        validate_ai_name(&reply)
    }

    /// Never fails: regex, AI, an optional OCR retry, then the default
    pub async fn identify_or_default(&self, pages: &RecoveredText, ocr: Option<OcrNameSource<'_>>) -> String {
        let first_miss = match self.identify(pages).await {
            Ok(name) => return name,
            Err(e) => e,
        };
        log::info!("Patient name not found in recovered text: {}", first_miss);

        if let Some(source) = ocr {
            match source.adapter.ocr(source.doc, source.engine, source.temp).await {
                Ok(ocr_pages) => match self.identify(&ocr_pages).await {
                    Ok(name) => return name,
                    Err(e) => log::info!("OCR retry found no patient name: {}", e),
                },
                Err(e) => log::warn!("OCR retry for patient name failed: {:#}", e),
            }
        }

        DEFAULT_PATIENT_NAME.to_string()
    }
}

/// First label pattern whose cleaned capture looks like a full name
pub fn match_name_patterns(prefix: &str) -> Option<String> {
    NAME_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures_iter(prefix)
            .filter_map(|cap| cap.get(1).map(|m| clean_candidate(m.as_str())))
            .find(|candidate| looks_like_full_name(candidate))
    })
}

fn clean_candidate(raw: &str) -> String {
    let cut = WIDE_GAP.replace(raw.trim(), "");
    let cut = TRAILING_FIELD.replace(&cut, "");
    cut.trim()
        .trim_end_matches(|c: char| matches!(c, ',' | ';' | ':' | '-' | '|' | '.'))
        .trim()
        .to_string()
}

fn looks_like_full_name(candidate: &str) -> bool {
    candidate.chars().count() > 3 && candidate.contains(' ') && candidate.chars().any(char::is_alphabetic)
}

/// Accept an AI reply only if it is a plausible full name
pub fn validate_ai_name(reply: &str) -> Result<String, NameNotFound> {
    let name = reply
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim();
    let name = name
        .strip_prefix("Paciente:")
        .or_else(|| name.strip_prefix("Nome:"))
        .unwrap_or(name)
        .trim();

    if name.to_uppercase().contains(NOT_FOUND_SENTINEL) {
        return Err(NameNotFound("AI reported no name".to_string()));
    }
    if name.chars().count() < 4 {
        return Err(NameNotFound(format!("AI reply too short: {:?}", name)));
    }
    if !name.contains(' ') {
        return Err(NameNotFound("AI reply is not a full name".to_string()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Page;
    use async_trait::async_trait;

    struct CannedAi(&'static str);

    #[async_trait]
    impl AiTextCapability for CannedAi {
        async fn complete(&self, _system: &str, _user: &str, _max_tokens: u32, _temperature: f32) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingAi;

    #[async_trait]
    impl AiTextCapability for FailingAi {
        async fn complete(&self, _system: &str, _user: &str, _max_tokens: u32, _temperature: f32) -> anyhow::Result<String> {
            anyhow::bail!("service unavailable")
        }
    }

    fn pages(text: &str) -> RecoveredText {
        RecoveredText::new(vec![Page::numbered(1, text)])
    }

    fn identifier(ai: Option<Arc<dyn AiTextCapability>>) -> PatientIdentifier {
        PatientIdentifier::new(3000, ai, Duration::from_secs(5))
    }

    #[test]
    fn test_label_patterns() {
        assert_eq!(match_name_patterns("Paciente: JOAO DA SILVA\nGlicose: 95").as_deref(), Some("JOAO DA SILVA"));
        assert_eq!(
            match_name_patterns("Nome do Paciente: Maria Souza Lima   Idade: 45").as_deref(),
            Some("Maria Souza Lima")
        );
        assert_eq!(
            match_name_patterns("Paciente ANA PAULA COSTA\nExame").as_deref(),
            Some("ANA PAULA COSTA")
        );
        assert_eq!(
            match_name_patterns("Nome: Carlos Alberto Dias Data: 01/02/2024").as_deref(),
            Some("Carlos Alberto Dias")
        );
    }

    #[test]
    fn test_single_word_is_rejected() {
        assert_eq!(match_name_patterns("Paciente: JOAO\nResultado"), None);
    }

    #[test]
    fn test_validate_ai_name() {
        assert_eq!(validate_ai_name(" \"Ana Lima\" ").unwrap(), "Ana Lima");
        assert!(validate_ai_name("NAO_ENCONTRADO").is_err());
        assert!(validate_ai_name("Ana").is_err());
        assert!(validate_ai_name("Anastasia").is_err());
    }

    #[tokio::test]
    async fn test_ai_fallback_used_on_regex_miss() {
        let id = identifier(Some(Arc::new(CannedAi("Pedro Alves"))));
        let name = id.identify(&pages("Laboratorio Central\nPEDRO ALVES 32 anos")).await.unwrap();
        assert_eq!(name, "Pedro Alves");
    }

    #[tokio::test]
    async fn test_sentinel_degrades_to_default() {
        let id = identifier(Some(Arc::new(CannedAi("NAO_ENCONTRADO"))));
        let name = id.identify_or_default(&pages("no labels here at all"), None).await;
        assert_eq!(name, DEFAULT_PATIENT_NAME);
    }

    #[tokio::test]
    async fn test_ai_error_degrades_to_default() {
        let id = identifier(Some(Arc::new(FailingAi)));
        assert!(id.identify(&pages("nothing")).await.is_err());
        assert_eq!(id.identify_or_default(&pages("nothing"), None).await, DEFAULT_PATIENT_NAME);
    }

    #[tokio::test]
    async fn test_no_text_pages() {
        let id = identifier(None);
        let empty = RecoveredText::new(vec![Page::Unrecoverable { index: 1 }]);
        assert!(id.identify(&empty).await.is_err());
        assert_eq!(id.identify_or_default(&empty, None).await, DEFAULT_PATIENT_NAME);
    }
}
