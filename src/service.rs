use std::sync::Arc;

use serde::Serialize;

use crate::blob_offload::offload_round_trip;
use crate::capabilities::Capabilities;
use crate::config::ProcessingConfig;
use crate::document::{Document, DocumentSource};
use crate::error::LabReportError;
use crate::health::{DocumentHealthValidator, HealthReport};
use crate::patient::{OcrNameSource, PatientIdentifier, DEFAULT_PATIENT_NAME};
use crate::protection::{ProtectionAnalyzer, ProtectionProfile};
use crate::recovery::{ExtractionMethod, RecoveryAttempt, RecoveryOutcome, RecoveryPipeline};
use crate::summarizer::ResultSummarizer;
use crate::temp_resources::TempResourceManager;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSummary {
    pub page: String,
    pub content: String,
}

/// What a caller receives for every accepted upload, including total failures
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabReportResponse {
    pub summaries: Vec<PageSummary>,
    pub patient_name: String,
    pub extraction_method: ExtractionMethod,
    pub processing_details: Vec<RecoveryAttempt>,
    pub error_pages: Vec<usize>,
    pub protection: ProtectionProfile,
    pub health: HealthReport,
}

pub struct LabReportService {
    config: Arc<ProcessingConfig>,
    capabilities: Capabilities,
    validator: DocumentHealthValidator,
    analyzer: ProtectionAnalyzer,
    pipeline: RecoveryPipeline,
    identifier: PatientIdentifier,
    summarizer: ResultSummarizer,
}

impl LabReportService {
    pub fn new(config: ProcessingConfig, capabilities: Capabilities) -> Self {
        let config = Arc::new(config);
        Self {
            validator: DocumentHealthValidator::new(config.max_file_size),
            analyzer: ProtectionAnalyzer::new(config.protection_scan_bytes),
            pipeline: RecoveryPipeline::new(config.clone(), capabilities.clone()),
            identifier: PatientIdentifier::new(
                config.patient_scan_chars,
                capabilities.ai.clone(),
                config.capability_timeout,
            ),
            summarizer: ResultSummarizer::new(
                capabilities.ai.clone(),
                config.chunk_chars(),
                config.summary_concurrency,
                config.capability_timeout,
            ),
            config,
            capabilities,
        }
    }

    /// Process one upload end to end.
    ///
    /// Only input rejections and I/O faults on the source are errors. A
    /// document that no stage can read still produces a response with
    /// `extractionMethod = failure` and the full attempt list.
    pub async fn process(&self, source: DocumentSource) -> Result<LabReportResponse, LabReportError> {
        let doc = source.resolve().await?;
        log::info!("Processing {} ({} bytes)", doc.filename(), doc.len());

        let health = self.check_health(&doc).await?;
        if let Some(reason) = health.details.rejection {
            log::warn!("Rejected {}: {}", doc.filename(), reason);
            return Err(LabReportError::Rejected(reason));
        }
        if !health.valid || health.needs_repair {
            log::info!("Health check for {}: {}", doc.filename(), health.message);
        }

        let doc = match &self.capabilities.blob_store {
            Some(store) => {
                offload_round_trip(
                    store.as_ref(),
                    doc,
                    self.config.inline_processing_limit,
                    self.config.blob_get_attempts,
                    self.config.blob_backoff_base,
                )
                .await
            }
            None => doc,
        };

        let protection = self.detect_protection(&doc).await?;
        if protection.is_protected {
            log::info!("{}: {}", doc.filename(), protection.description);
        }

        let mut temp = TempResourceManager::new(&self.config.temp_dir);
        let result = self.recover_and_summarize(&doc, protection, health, &mut temp).await;
        temp.release_all();

        if let Err(e) = &result {
            log::error!("Processing {} aborted: {}", doc.filename(), e);
        }
        result
    }

    async fn detect_protection(&self, doc: &Document) -> Result<ProtectionProfile, LabReportError> {
        let analyzer = self.analyzer;
        let doc = doc.clone();
        tokio::task::spawn_blocking(move || analyzer.detect_protection(&doc))
            .await
            .map_err(|e| LabReportError::Processing(format!("protection scan task failed: {}", e)))
    }

    async fn check_health(&self, doc: &Document) -> Result<HealthReport, LabReportError> {
        let validator = self.validator;
        let doc = doc.clone();
        tokio::task::spawn_blocking(move || validator.validate(&doc))
            .await
            .map_err(|e| LabReportError::Processing(format!("health check task failed: {}", e)))
    }

    async fn recover_and_summarize(
        &self,
        doc: &Document,
        protection: ProtectionProfile,
        health: HealthReport,
        temp: &mut TempResourceManager,
    ) -> Result<LabReportResponse, LabReportError> {
        let outcome = self.pipeline.run(doc, &protection, temp).await?;

        if outcome.is_failure() {
            let content = outcome
                .text
                .text_pages()
                .map(|(_, text)| text)
                .collect::<Vec<_>>()
                .join("\n\n");
            let summaries = vec![PageSummary {
                page: "1".to_string(),
                content,
            }];
            return Ok(Self::respond(outcome, summaries, DEFAULT_PATIENT_NAME.to_string(), protection, health));
        }

        let patient_name = self.identify(doc, &outcome, temp).await;
        log::info!("Patient name resolved ({} chars)", patient_name.chars().count());

        let summary = self.summarizer.summarize(&outcome.text, &patient_name).await;
        log::info!(
            "Summary for {} holds {} result line(s)",
            doc.filename(),
            summary.ordered_result_lines.len()
        );

        let summaries = vec![PageSummary {
            page: page_range_label(outcome.text.len()),
            content: summary.body(),
        }];
        Ok(Self::respond(outcome, summaries, patient_name, protection, health))
    }

    async fn identify(
        &self,
        doc: &Document,
        outcome: &RecoveryOutcome,
        temp: &mut TempResourceManager,
    ) -> String {
        let already_ocr = matches!(outcome.method, ExtractionMethod::Ocr | ExtractionMethod::OcrApi);
        let ocr = match &self.capabilities.ocr {
            Some(engine) if !already_ocr => Some(OcrNameSource {
                adapter: self.pipeline.adapter(),
                engine: engine.as_ref(),
                doc,
                temp,
            }),
            _ => None,
        };
        self.identifier.identify_or_default(&outcome.text, ocr).await
    }

    fn respond(
        outcome: RecoveryOutcome,
        summaries: Vec<PageSummary>,
        patient_name: String,
        protection: ProtectionProfile,
        health: HealthReport,
    ) -> LabReportResponse {
        LabReportResponse {
            summaries,
            patient_name,
            extraction_method: outcome.method,
            processing_details: outcome.attempts,
            error_pages: outcome.error_pages,
            protection,
            health,
        }
    }
}

/// "1" for a single page, "1-N" otherwise
fn page_range_label(pages: usize) -> String {
    if pages <= 1 {
        "1".to_string()
    } else {
        format!("1-{}", pages)
    }
}
