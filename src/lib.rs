/// Lab Report Reader - recovers text from damaged or protected laboratory
/// report PDFs, identifies the patient and summarizes the exam results

pub mod blob_offload;
pub mod capabilities;
pub mod config;
pub mod document;
pub mod error;
pub mod health;
pub mod logging;
pub mod patient;
pub mod pdf_surgery;
pub mod protection;
pub mod recovery;
pub mod repair;
pub mod service;
pub mod summarizer;
pub mod temp_resources;
pub mod text_extraction;

/// Re-export the service entry point
pub use service::{LabReportResponse, LabReportService, PageSummary};

/// Re-export configuration and errors
pub use config::ProcessingConfig;
pub use error::{LabReportError, NameNotFound, RejectionReason};

/// Re-export the document model
pub use document::{Document, DocumentSource, Page, PageId, RecoveredText};

/// Re-export the pipeline components
pub use health::{DocumentHealthValidator, HealthReport};
pub use patient::{PatientIdentifier, DEFAULT_PATIENT_NAME};
pub use protection::{ProtectionAnalyzer, ProtectionProfile};
pub use recovery::{ExtractionMethod, RecoveryAttempt, RecoveryPipeline, RecoveryStage};
pub use summarizer::{ResultSummarizer, Summary};
pub use temp_resources::TempResourceManager;
pub use text_extraction::TextExtractionAdapter;

/// Re-export capability seams
pub use capabilities::{AiTextCapability, BlobStore, Capabilities, ExternalRepairer, OcrEngine, OcrPage, TextExtractor};
