use std::fmt;

use thiserror::Error;

/// Why an upload was refused before entering the recovery pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    Oversized { size: usize, limit: usize },
    NotPdf,
    EmptyUpload,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Oversized { size, limit } => {
                write!(f, "oversized: {} bytes exceeds the {} byte limit", size, limit)
            }
            RejectionReason::NotPdf => write!(f, "not a PDF: missing %PDF- signature"),
            RejectionReason::EmptyUpload => write!(f, "missing upload: no bytes received"),
        }
    }
}

/// Errors surfaced to the caller of the lab report service.
///
/// Recovery-stage and capability failures never appear here; they are
/// recorded as failed recovery attempts instead. The exception is a temp
/// storage fault, which surfaces as `Processing`.
#[derive(Debug, Error)]
pub enum LabReportError {
    #[error("input rejected: {0}")]
    Rejected(RejectionReason),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("processing failed: {0}")]
    Processing(String),
}

impl LabReportError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        LabReportError::Io { path: path.into(), source }
    }

    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            LabReportError::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for LabReportError {
    fn from(err: anyhow::Error) -> Self {
        LabReportError::Processing(format!("{:#}", err))
    }
}

/// No plausible patient name could be found
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("patient name not found: {0}")]
pub struct NameNotFound(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_messages() {
        let oversized = RejectionReason::Oversized { size: 10, limit: 5 };
        assert!(oversized.to_string().starts_with("oversized"));
        assert!(RejectionReason::NotPdf.to_string().contains("not a PDF"));
    }

    #[test]
    fn test_anyhow_conversion_keeps_context_chain() {
        let err = anyhow::anyhow!("disk full").context("writing decrypted copy");
        let converted: LabReportError = err.into();
        let message = converted.to_string();
        assert!(message.contains("writing decrypted copy"));
        assert!(message.contains("disk full"));
        assert!(converted.rejection_reason().is_none());
    }
}
