//! Ordered fallback chain that turns a possibly damaged or protected PDF
//! into usable text.
//!
//! Stages run strictly one after another. The first stage whose text passes
//! the usability check wins; every attempt before it is kept for diagnostics.
//! When every stage fails the pipeline still returns a result: a single
//! explanatory page with `ExtractionMethod::Failure`. The only error out of
//! `run` is a temp storage fault, which says nothing about the document.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::capabilities::{with_timeout, Capabilities};
use crate::config::ProcessingConfig;
use crate::document::{Document, Page, PageId, RecoveredText};
use crate::pdf_surgery;
use crate::protection::ProtectionProfile;
use crate::repair;
use crate::temp_resources::{is_storage_failure, TempResourceManager};
use crate::text_extraction::{metadata_only, MetadataSummary, TextExtractionAdapter};

pub const TOTAL_FAILURE_MESSAGE: &str = "This document could not be read. Every recovery strategy failed \
to produce text; it may be a scanned image with no OCR service available, badly damaged, or locked with a password.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    Direct,
    OcrFirst,
    Decrypt,
    Repair,
    Ghostscript,
    Split,
    OcrFallback,
    Reconstruct,
}

impl RecoveryStage {
    pub const ORDER: [RecoveryStage; 8] = [
        RecoveryStage::Direct,
        RecoveryStage::OcrFirst,
        RecoveryStage::Decrypt,
        RecoveryStage::Repair,
        RecoveryStage::Ghostscript,
        RecoveryStage::Split,
        RecoveryStage::OcrFallback,
        RecoveryStage::Reconstruct,
    ];

    pub fn method(self) -> RecoveryMethod {
        match self {
            RecoveryStage::Direct => RecoveryMethod::Direct,
            RecoveryStage::OcrFirst | RecoveryStage::OcrFallback => RecoveryMethod::Ocr,
            RecoveryStage::Decrypt => RecoveryMethod::Decrypt,
            RecoveryStage::Repair => RecoveryMethod::Repair,
            RecoveryStage::Ghostscript => RecoveryMethod::Ghostscript,
            RecoveryStage::Split => RecoveryMethod::Split,
            RecoveryStage::Reconstruct => RecoveryMethod::Reconstruct,
        }
    }

    pub fn extraction_method(self) -> ExtractionMethod {
        match self {
            RecoveryStage::Direct => ExtractionMethod::Direct,
            RecoveryStage::OcrFirst => ExtractionMethod::Ocr,
            RecoveryStage::Decrypt => ExtractionMethod::Decrypted,
            RecoveryStage::Repair | RecoveryStage::Reconstruct => ExtractionMethod::Repaired,
            RecoveryStage::Ghostscript => ExtractionMethod::GsRepaired,
            RecoveryStage::Split => ExtractionMethod::Split,
            RecoveryStage::OcrFallback => ExtractionMethod::OcrApi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMethod {
    Direct,
    Decrypt,
    Repair,
    Ghostscript,
    Split,
    Ocr,
    Reconstruct,
}

/// Reported to the caller as `extractionMethod`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Direct,
    Decrypted,
    Repaired,
    GsRepaired,
    Split,
    Ocr,
    OcrApi,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAttempt {
    pub method: RecoveryMethod,
    pub stage: RecoveryStage,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub text: RecoveredText,
    pub method: ExtractionMethod,
    pub stage: Option<RecoveryStage>,
    pub attempts: Vec<RecoveryAttempt>,
    pub error_pages: Vec<usize>,
}

impl RecoveryOutcome {
    pub fn is_failure(&self) -> bool {
        self.method == ExtractionMethod::Failure
    }
}

struct StageSuccess {
    text: RecoveredText,
    error_pages: Vec<usize>,
}

impl StageSuccess {
    fn text(text: RecoveredText) -> Self {
        Self {
            text,
            error_pages: Vec::new(),
        }
    }
}

/// Mutable bookkeeping for one pipeline run
struct RunState<'t> {
    temp: &'t mut TempResourceManager,
    /// Latest decrypted or repaired copy, preferred by the late stages
    derivative: Option<Document>,
    ocr_on_original_done: bool,
    metadata: Option<MetadataSummary>,
}

pub struct RecoveryPipeline {
    config: Arc<ProcessingConfig>,
    capabilities: Capabilities,
    adapter: TextExtractionAdapter,
}

impl RecoveryPipeline {
    pub fn new(config: Arc<ProcessingConfig>, capabilities: Capabilities) -> Self {
        let adapter = TextExtractionAdapter::new(&config, capabilities.extractors.clone());
        Self {
            config,
            capabilities,
            adapter,
        }
    }

    pub fn adapter(&self) -> &TextExtractionAdapter {
        &self.adapter
    }

    pub async fn run(
        &self,
        doc: &Document,
        profile: &ProtectionProfile,
        temp: &mut TempResourceManager,
    ) -> Result<RecoveryOutcome> {
        let mut state = RunState {
            temp,
            derivative: None,
            ocr_on_original_done: false,
            metadata: None,
        };
        let mut attempts: Vec<RecoveryAttempt> = Vec::new();

        for stage in RecoveryStage::ORDER {
            let Some(result) = self.run_stage(stage, doc, profile, &mut state).await else {
                log::debug!("Stage {:?} not applicable", stage);
                continue;
            };

            match result {
                Ok(success) if success.text.is_usable(self.config.min_text_length) => {
                    log::info!(
                        "Stage {:?} recovered {} pages from {}",
                        stage,
                        success.text.len(),
                        doc.filename()
                    );
                    attempts.push(RecoveryAttempt {
                        method: stage.method(),
                        stage,
                        success: true,
                        error_detail: None,
                    });
                    let mut error_pages = success.error_pages;
                    error_pages.extend(success.text.unrecoverable_pages());
                    error_pages.sort_unstable();
                    error_pages.dedup();
                    return Ok(RecoveryOutcome {
                        text: success.text,
                        method: stage.extraction_method(),
                        stage: Some(stage),
                        attempts,
                        error_pages,
                    });
                }
                Ok(success) => {
                    let detail = format!(
                        "text too short ({} chars on first page, need more than {})",
                        success.text.first_text_len(),
                        self.config.min_text_length
                    );
                    log::warn!("Stage {:?} failed: {}", stage, detail);
                    attempts.push(failed(stage, detail));
                }
                Err(e) if is_storage_failure(&e) => {
                    log::error!("Stage {:?} aborted by temp storage failure: {:#}", stage, e);
                    return Err(e.context(format!("{:?} stage could not write intermediate files", stage)));
                }
                Err(e) => {
                    let detail = format!("{:#}", e);
                    log::warn!("Stage {:?} failed: {}", stage, detail);
                    attempts.push(failed(stage, detail));
                }
            }
        }

        log::warn!("All {} recovery attempts failed for {}", attempts.len(), doc.filename());
        let metadata = match state.metadata.take() {
            Some(metadata) => metadata,
            None => self.scrape_metadata(doc).await,
        };
        Ok(RecoveryOutcome {
            text: RecoveredText::new(vec![Page::numbered(1, failure_text(&metadata))]),
            method: ExtractionMethod::Failure,
            stage: None,
            attempts,
            error_pages: Vec::new(),
        })
    }

    async fn run_stage(
        &self,
        stage: RecoveryStage,
        doc: &Document,
        profile: &ProtectionProfile,
        state: &mut RunState<'_>,
    ) -> Option<Result<StageSuccess>> {
        let has_ocr = self.capabilities.ocr.is_some();
        match stage {
            RecoveryStage::Direct => {
                if profile.is_encrypted && has_ocr {
                    return None;
                }
                Some(self.direct(doc, state).await)
            }
            RecoveryStage::OcrFirst => {
                if !profile.is_encrypted || !has_ocr {
                    return None;
                }
                state.ocr_on_original_done = true;
                Some(self.ocr(doc, state).await)
            }
            RecoveryStage::Decrypt => {
                if !profile.is_protected && !profile.is_encrypted {
                    return None;
                }
                Some(self.decrypt(doc, state).await)
            }
            RecoveryStage::Repair => Some(self.repair(doc, state).await),
            RecoveryStage::Ghostscript => {
                if !self.config.external_tools_enabled || self.capabilities.repairer.is_none() {
                    return None;
                }
                Some(self.ghostscript(doc, state).await)
            }
            RecoveryStage::Split => Some(self.split(doc, state).await),
            RecoveryStage::OcrFallback => {
                if !has_ocr || (state.ocr_on_original_done && state.derivative.is_none()) {
                    return None;
                }
                let target = state.derivative.clone().unwrap_or_else(|| doc.clone());
                Some(self.ocr(&target, state).await)
            }
            RecoveryStage::Reconstruct => {
                let target = state.derivative.clone().unwrap_or_else(|| doc.clone());
                Some(self.reconstruct(&target, state).await)
            }
        }
    }

    async fn direct(&self, doc: &Document, state: &mut RunState<'_>) -> Result<StageSuccess> {
        match self.adapter.extract(doc).await {
            Ok(extraction) => {
                log::debug!("Direct extraction via {} ({:?} tier)", extraction.backend, extraction.tier);
                Ok(StageSuccess::text(extraction.text))
            }
            Err(failure) => {
                state.metadata = Some(failure.metadata.clone());
                Err(failure.into())
            }
        }
    }

    async fn ocr(&self, doc: &Document, state: &mut RunState<'_>) -> Result<StageSuccess> {
        let engine = self.capabilities.ocr.as_ref().context("No OCR engine configured")?;
        let text = self.adapter.ocr(doc, engine.as_ref(), state.temp).await?;
        Ok(StageSuccess::text(text))
    }

    /// Strip protection by rebuilding the document page by page
    async fn decrypt(&self, doc: &Document, state: &mut RunState<'_>) -> Result<StageSuccess> {
        let bytes = doc.shared_bytes();
        let passwords = self.config.common_passwords.clone();

        let outcome = blocking(move || {
            let mut pdf = match pdf_surgery::load_tolerant(&bytes) {
                Ok(pdf) => pdf,
                Err(e) => {
                    log::debug!("Standard load failed ({:#}), retrying without encryption entry", e);
                    let (stripped, _) = repair::strip_encryption(&bytes);
                    pdf_surgery::load_tolerant(&stripped).context("Tolerant load failed")?
                }
            };
            if let Some(index) = pdf_surgery::try_passwords(&mut pdf, &passwords) {
                log::info!("Decryption succeeded with password candidate #{}", index);
            }
            pdf_surgery::rebuild_pages(pdf)
        })
        .await?;

        self.extract_derivative(doc, "decrypted", outcome, state).await
    }

    async fn repair(&self, doc: &Document, state: &mut RunState<'_>) -> Result<StageSuccess> {
        let bytes = doc.shared_bytes();
        let outcome = blocking(move || {
            let report = repair::repair_bytes(&bytes)?;
            log::debug!("Byte repair actions: {:?}", report.actions);
            let pdf = pdf_surgery::load_tolerant(&report.bytes).context("Repaired bytes still do not load")?;
            pdf_surgery::rebuild_pages(pdf)
        })
        .await?;

        self.extract_derivative(doc, "repaired", outcome, state).await
    }

    async fn extract_derivative(
        &self,
        doc: &Document,
        label: &str,
        outcome: pdf_surgery::SurgeryOutcome,
        state: &mut RunState<'_>,
    ) -> Result<StageSuccess> {
        state.temp.write(label, &outcome.bytes)?;
        let derived = doc.derive(outcome.bytes, label);
        state.derivative = Some(derived.clone());

        let extraction = self.adapter.extract(&derived).await?;
        let mut text = extraction.text;
        if text.len() == outcome.copied + outcome.error_pages.len() {
            text.mark_unrecoverable(&outcome.error_pages);
        }
        Ok(StageSuccess {
            text,
            error_pages: outcome.error_pages,
        })
    }

    async fn ghostscript(&self, doc: &Document, state: &mut RunState<'_>) -> Result<StageSuccess> {
        let repairer = self.capabilities.repairer.as_ref().context("No external repairer configured")?;
        let input = state.temp.write("gs-in", doc.bytes())?;
        let output = state.temp.reserve("gs-out")?;

        let repaired = with_timeout(
            self.config.capability_timeout,
            "external repair",
            repairer.repair(&input, &output),
        )
        .await?;
        let bytes = tokio::fs::read(&repaired)
            .await
            .with_context(|| format!("Failed to read repaired file: {}", repaired.display()))?;
        state.temp.track(repaired);

        let derived = doc.derive(bytes, "gs");
        let extraction = self.adapter.extract(&derived).await?;
        state.derivative = Some(derived);
        Ok(StageSuccess::text(extraction.text))
    }

    /// Direct parse of fixed-size page groups; aggressive single-page mode
    /// when the normal grouping yields nothing
    async fn split(&self, doc: &Document, state: &mut RunState<'_>) -> Result<StageSuccess> {
        let normal = self.config.split_pages_per_part;
        let aggressive = self.config.aggressive_split_pages_per_part;

        match self.split_with(doc, normal, state).await {
            Ok(text) if text.is_usable(self.config.min_text_length) || normal == aggressive => {
                Ok(StageSuccess::text(text))
            }
            Ok(_) | Err(_) => {
                log::info!("Split into {} page parts failed, retrying with {} page parts", normal, aggressive);
                self.split_with(doc, aggressive, state).await.map(StageSuccess::text)
            }
        }
    }

    async fn split_with(&self, doc: &Document, pages_per_part: usize, state: &mut RunState<'_>) -> Result<RecoveredText> {
        let bytes = doc.shared_bytes();
        let parts = blocking(move || pdf_surgery::split_into_parts(&bytes, pages_per_part)).await?;

        let mut pages = Vec::new();
        let mut skipped = 0usize;
        for part in parts {
            state.temp.write("split-part", &part.bytes)?;
            match self.adapter.extract_text_layer(part.bytes.clone()).await {
                Ok((_, text)) => pages.extend(offset_pages(text, part.first_page)),
                Err(e) => {
                    skipped += 1;
                    log::debug!("Split part {} skipped: {:#}", part.label(), e);
                }
            }
        }

        if pages.is_empty() {
            anyhow::bail!("No part of the {} page split produced text ({} skipped)", pages_per_part, skipped);
        }
        Ok(RecoveredText::new(pages))
    }

    /// Rebuild from only the pages that reload independently
    async fn reconstruct(&self, doc: &Document, state: &mut RunState<'_>) -> Result<StageSuccess> {
        let bytes = doc.shared_bytes();
        let outcome = blocking(move || pdf_surgery::reassemble_reloadable(&bytes)).await?;
        state.temp.write("reconstructed", &outcome.bytes)?;

        let total = outcome.page_count();
        let survivors: Vec<usize> = (1..=total).filter(|n| !outcome.error_pages.contains(n)).collect();
        let derived = doc.derive(outcome.bytes, "reconstructed");
        let extraction = self.adapter.extract(&derived).await?;

        // Map pages back to their original positions
        let mut pages: Vec<Page> = (1..=total).map(|index| Page::Unrecoverable { index }).collect();
        for (position, page) in extraction.text.pages.into_iter().enumerate() {
            if let Some(&original) = survivors.get(position) {
                pages[original - 1] = match page {
                    Page::Text { text, .. } => Page::numbered(original, text),
                    Page::Unrecoverable { .. } => Page::Unrecoverable { index: original },
                };
            }
        }

        Ok(StageSuccess {
            text: RecoveredText::new(pages),
            error_pages: outcome.error_pages,
        })
    }

    async fn scrape_metadata(&self, doc: &Document) -> MetadataSummary {
        let bytes = doc.shared_bytes();
        let scan = self.config.protection_scan_bytes;
        let size = doc.len();
        let task = async move {
            tokio::task::spawn_blocking(move || metadata_only(&bytes, scan))
                .await
                .context("Metadata task failed")
        };
        with_timeout(self.config.capability_timeout, "metadata scrape", task)
            .await
            .unwrap_or_else(|e| {
                log::warn!("{:#}", e);
                MetadataSummary {
                    size,
                    ..MetadataSummary::default()
                }
            })
    }
}

fn failed(stage: RecoveryStage, detail: String) -> RecoveryAttempt {
    RecoveryAttempt {
        method: stage.method(),
        stage,
        success: false,
        error_detail: Some(detail),
    }
}

fn failure_text(metadata: &MetadataSummary) -> String {
    format!("{}\n\n{}", TOTAL_FAILURE_MESSAGE, metadata.describe())
}

/// Renumber part-local pages to document positions
fn offset_pages(text: RecoveredText, first_page: usize) -> Vec<Page> {
    text.pages
        .into_iter()
        .map(|page| match page {
            Page::Text {
                id: PageId::Number(n),
                text,
            } => Page::numbered(first_page + n - 1, text),
            Page::Unrecoverable { index } => Page::Unrecoverable {
                index: first_page + index - 1,
            },
            other => other,
        })
        .collect()
}

/// Run blocking PDF work off the async scheduler; a panic becomes an error
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.context("PDF worker panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{default_extractors, ExternalRepairer, OcrEngine, OcrPage, RawExtraction, TextExtractor};
    use crate::pdf_surgery::fixtures::{text_pdf, text_pdf_bytes};
    use crate::protection::ProtectionAnalyzer;
    use crate::temp_resources::TempStorageError;
    use async_trait::async_trait;
    use lopdf::Object;
    use std::path::{Path, PathBuf};

    const LONG_LINE: &str = "Hemoglobina: 14.2 | VR: 12.0 - 16.0 with padding to cross the threshold";

    struct FixedOcr(String);

    #[async_trait]
    impl OcrEngine for FixedOcr {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn recognize(&self, _path: &Path, _language: &str) -> Result<Vec<OcrPage>> {
            Ok(vec![OcrPage {
                identifier: "1".to_string(),
                text: self.0.clone(),
            }])
        }
    }

    /// Fails on the scanner's original bytes, reads any rewritten copy
    struct DerivativeOnlyOcr {
        marker: &'static [u8],
    }

    #[async_trait]
    impl OcrEngine for DerivativeOnlyOcr {
        fn name(&self) -> &'static str {
            "derivative-only"
        }

        async fn recognize(&self, path: &Path, _language: &str) -> Result<Vec<OcrPage>> {
            let bytes = tokio::fs::read(path).await?;
            if memchr::memmem::find(&bytes, self.marker).is_some() {
                anyhow::bail!("image too noisy to recognize");
            }
            Ok(vec![OcrPage {
                identifier: "1".to_string(),
                text: format!("Paciente: ANA LIMA\n{}", LONG_LINE),
            }])
        }
    }

    /// Writes a known-good document to the requested output path
    struct CopyRepairer(Vec<u8>);

    #[async_trait]
    impl ExternalRepairer for CopyRepairer {
        async fn repair(&self, input: &Path, output: &Path) -> Result<PathBuf> {
            assert!(input.exists());
            tokio::fs::write(output, &self.0).await?;
            Ok(output.to_path_buf())
        }
    }

    /// Only reads documents that went through page rebuilding
    struct RebuiltOnlyExtractor;

    impl TextExtractor for RebuiltOnlyExtractor {
        fn name(&self) -> &'static str {
            "rebuilt-only"
        }

        fn extract(&self, bytes: &[u8]) -> Result<RawExtraction> {
            if memchr::memmem::find(bytes, b"unrecoverable]").is_none() {
                anyhow::bail!("unsupported layout");
            }
            let mut last_error = None;
            for backend in default_extractors() {
                match backend.extract(bytes) {
                    Ok(raw) => return Ok(raw),
                    Err(e) => last_error = Some(e),
                }
            }
            Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no backends")))
        }
    }

    fn protected_profile() -> ProtectionProfile {
        let mut profile = ProtectionProfile::unprotected();
        profile.is_protected = true;
        profile
    }

    fn encrypted_profile() -> ProtectionProfile {
        let mut profile = protected_profile();
        profile.is_encrypted = true;
        profile
    }

    fn stages(outcome: &RecoveryOutcome) -> Vec<(RecoveryStage, bool)> {
        outcome.attempts.iter().map(|a| (a.stage, a.success)).collect()
    }

    fn pipeline(capabilities: Capabilities) -> RecoveryPipeline {
        RecoveryPipeline::new(Arc::new(ProcessingConfig::default()), capabilities)
    }

    #[test]
    fn test_stage_order_and_method_mapping() {
        assert!(RecoveryStage::ORDER.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(RecoveryStage::OcrFirst.extraction_method(), ExtractionMethod::Ocr);
        assert_eq!(RecoveryStage::OcrFallback.extraction_method(), ExtractionMethod::OcrApi);
        assert_eq!(RecoveryStage::Reconstruct.extraction_method(), ExtractionMethod::Repaired);
        assert_eq!(
            serde_json::to_value(ExtractionMethod::GsRepaired).unwrap(),
            serde_json::json!("gs_repaired")
        );
    }

    #[test]
    fn test_offset_pages() {
        let text = RecoveredText::new(vec![Page::numbered(1, "a"), Page::Unrecoverable { index: 2 }]);
        let pages = offset_pages(text, 6);
        assert_eq!(pages, vec![Page::numbered(6, "a"), Page::Unrecoverable { index: 7 }]);
    }

    #[tokio::test]
    async fn test_direct_success_records_single_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let mut temp = TempResourceManager::new(dir.path());
        let doc = Document::new(text_pdf_bytes(&[LONG_LINE]), "plain.pdf");
        let profile = ProtectionAnalyzer::new(20_000).detect_protection(&doc);

        let outcome = pipeline(Capabilities::offline()).run(&doc, &profile, &mut temp).await.unwrap();
        assert_eq!(outcome.method, ExtractionMethod::Direct);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.attempts[0].success);
    }

    #[tokio::test]
    async fn test_encrypted_profile_goes_to_ocr_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut temp = TempResourceManager::new(dir.path());
        let doc = Document::new(text_pdf_bytes(&[""]), "locked.pdf");
        let profile = encrypted_profile();

        let caps = Capabilities::offline().with_ocr(Arc::new(FixedOcr(format!("Paciente: ANA LIMA\n{}", LONG_LINE))));
        let outcome = pipeline(caps).run(&doc, &profile, &mut temp).await.unwrap();

        assert_eq!(outcome.method, ExtractionMethod::Ocr);
        assert_eq!(outcome.attempts.first().map(|a| a.stage), Some(RecoveryStage::OcrFirst));
        temp.release_all();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_total_failure_returns_explanatory_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut temp = TempResourceManager::new(dir.path());
        let doc = Document::new(b"%PDF-1.4\nnot really a pdf at all".to_vec(), "broken.pdf");
        let profile = ProtectionProfile::unprotected();

        let outcome = pipeline(Capabilities::offline()).run(&doc, &profile, &mut temp).await.unwrap();
        assert!(outcome.is_failure());
        assert!(!outcome.attempts.is_empty());
        assert!(outcome.attempts.iter().all(|a| !a.success && a.error_detail.is_some()));
        assert_eq!(outcome.text.len(), 1);
        assert!(outcome.text.pages[0].text().unwrap().starts_with(TOTAL_FAILURE_MESSAGE));
    }
    #[tokio::test]
    async fn test_truncated_xref_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let mut temp = TempResourceManager::new(dir.path());
        let mut bytes = text_pdf_bytes(&[LONG_LINE]);
        let cut = memchr::memmem::find(&bytes, b"\nxref").unwrap();
        bytes.truncate(cut);
        let doc = Document::new(bytes, "truncated.pdf");

        let outcome = pipeline(Capabilities::offline())
            .run(&doc, &ProtectionProfile::unprotected(), &mut temp)
            .await
            .unwrap();

        assert_eq!(outcome.method, ExtractionMethod::Repaired);
        assert_eq!(
            stages(&outcome),
            vec![(RecoveryStage::Direct, false), (RecoveryStage::Repair, true)]
        );
        assert!(!temp.tracked().is_empty());
        temp.release_all();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_page_is_reported_as_error_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut temp = TempResourceManager::new(dir.path());
        let mut pdf = text_pdf(&[LONG_LINE, "Glicose: 95 | VR: 70 - 99", "Ureia: 30 | VR: 15 - 40"]);
        let second = pdf.get_pages()[&2];
        pdf.get_object_mut(second)
            .and_then(Object::as_dict_mut)
            .unwrap()
            .set("Contents", Object::Reference((9999, 0)));
        let mut bytes = Vec::new();
        pdf.save_to(&mut bytes).unwrap();
        let doc = Document::new(bytes, "damaged-page.pdf");

        let caps = Capabilities {
            extractors: vec![Arc::new(RebuiltOnlyExtractor)],
            ..Capabilities::offline()
        };
        let outcome = pipeline(caps)
            .run(&doc, &ProtectionProfile::unprotected(), &mut temp)
            .await
            .unwrap();

        assert!(!outcome.is_failure());
        assert_eq!(outcome.error_pages, vec![2]);
        assert_eq!(outcome.text.len(), 3);
        assert_eq!(outcome.text.pages[1], Page::Unrecoverable { index: 2 });
        assert!(outcome.text.pages[0].text().is_some());
    }

    #[tokio::test]
    async fn test_external_repairer_output_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut temp = TempResourceManager::new(dir.path());
        let doc = Document::new(b"%PDF-1.4\nheader survived, body did not".to_vec(), "mangled.pdf");
        let caps = Capabilities::offline().with_repairer(Arc::new(CopyRepairer(text_pdf_bytes(&[LONG_LINE]))));

        let outcome = pipeline(caps)
            .run(&doc, &ProtectionProfile::unprotected(), &mut temp)
            .await
            .unwrap();

        assert_eq!(outcome.method, ExtractionMethod::GsRepaired);
        assert_eq!(stages(&outcome).last(), Some(&(RecoveryStage::Ghostscript, true)));
        assert!(temp.tracked().iter().any(|p| p.exists()));
        temp.release_all();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_external_repair_skipped_when_tools_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut temp = TempResourceManager::new(dir.path());
        let doc = Document::new(b"%PDF-1.4\nheader survived, body did not".to_vec(), "mangled.pdf");
        let config = ProcessingConfig {
            external_tools_enabled: false,
            ..ProcessingConfig::default()
        };
        let caps = Capabilities::offline().with_repairer(Arc::new(CopyRepairer(text_pdf_bytes(&[LONG_LINE]))));

        let outcome = RecoveryPipeline::new(Arc::new(config), caps)
            .run(&doc, &ProtectionProfile::unprotected(), &mut temp)
            .await
            .unwrap();

        assert!(outcome.is_failure());
        assert!(outcome.attempts.iter().all(|a| a.stage != RecoveryStage::Ghostscript));
    }

    #[tokio::test]
    async fn test_ocr_fallback_reads_the_derivative() {
        let dir = tempfile::tempdir().unwrap();
        let mut temp = TempResourceManager::new(dir.path());
        let mut bytes = text_pdf_bytes(&[""]);
        bytes.extend_from_slice(b"%scanner-batch-0042\n");
        let doc = Document::new(bytes, "scan.pdf");

        let caps = Capabilities::offline().with_ocr(Arc::new(DerivativeOnlyOcr {
            marker: b"scanner-batch",
        }));
        let outcome = pipeline(caps).run(&doc, &encrypted_profile(), &mut temp).await.unwrap();

        assert_eq!(outcome.method, ExtractionMethod::OcrApi);
        assert_eq!(stages(&outcome).first(), Some(&(RecoveryStage::OcrFirst, false)));
        assert_eq!(stages(&outcome).last(), Some(&(RecoveryStage::OcrFallback, true)));
        temp.release_all();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_run_leaves_no_intermediate_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut temp = TempResourceManager::new(dir.path());
        let doc = Document::new(text_pdf_bytes(&["", ""]), "blank.pdf");

        let outcome = pipeline(Capabilities::offline())
            .run(&doc, &protected_profile(), &mut temp)
            .await
            .unwrap();

        assert!(outcome.is_failure());
        let executed: Vec<RecoveryStage> = outcome.attempts.iter().map(|a| a.stage).collect();
        assert!(executed.contains(&RecoveryStage::Decrypt));
        assert!(executed.contains(&RecoveryStage::Split));

        let written = temp.tracked().to_vec();
        assert!(written.len() >= 3, "decrypt, repair and split parts are written: {:?}", written);
        assert!(written.iter().all(|p| p.exists()));

        temp.release_all();
        temp.release_all();
        assert!(written.iter().all(|p| !p.exists()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unwritable_temp_dir_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("plain-file");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut temp = TempResourceManager::new(blocker.join("sub"));
        let doc = Document::new(text_pdf_bytes(&[""]), "locked.pdf");

        let caps = Capabilities::offline().with_ocr(Arc::new(FixedOcr(LONG_LINE.to_string())));
        let err = pipeline(caps).run(&doc, &encrypted_profile(), &mut temp).await.unwrap_err();

        assert!(err.chain().any(|cause| cause.is::<TempStorageError>()));
        assert!(format!("{:#}", err).contains("OcrFirst"));
    }
}
