use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment markers that indicate a constrained execution environment
/// where spawning external tools (Ghostscript) is not possible.
const CONSTRAINED_ENV_MARKERS: &[&str] = &["VERCEL", "AWS_LAMBDA_FUNCTION_NAME", "FUNCTIONS_WORKER_RUNTIME"];

/// Process-wide configuration, read once at startup and shared immutably
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub max_file_size: usize,
    pub min_text_length: usize,
    pub protection_scan_bytes: usize,
    pub patient_scan_chars: usize,
    pub chunk_token_budget: usize,
    pub chars_per_token: usize,
    #[serde(with = "duration_secs")]
    pub capability_timeout: Duration,
    pub ocr_payload_limit: usize,
    pub ocr_language: String,
    pub split_pages_per_part: usize,
    pub aggressive_split_pages_per_part: usize,
    pub common_passwords: Vec<String>,
    pub external_tools_enabled: bool,
    pub inline_processing_limit: usize,
    pub blob_get_attempts: u32,
    #[serde(with = "duration_secs")]
    pub blob_backoff_base: Duration,
    pub summary_concurrency: usize,
    pub temp_dir: PathBuf,
    /// Directory backing the local blob store; offload is off when unset
    pub blob_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub ai_endpoint: String,
    pub ai_model: String,
    pub ai_api_key: Option<String>,
    pub ocr_endpoint: String,
    pub ocr_api_key: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,  // 50MB upload limit
            min_text_length: 50,
            protection_scan_bytes: 20_000,
            patient_scan_chars: 3_000,
            chunk_token_budget: 3_000,
            chars_per_token: 4,
            capability_timeout: Duration::from_secs(45),
            ocr_payload_limit: 1024 * 1024,  // OCR services reject bodies over ~1MB
            ocr_language: "por".to_string(),
            split_pages_per_part: 5,
            aggressive_split_pages_per_part: 1,
            common_passwords: ["", "123456", "1234", "password", "senha", "laboratorio", "exame", "0000"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            external_tools_enabled: true,
            inline_processing_limit: 4 * 1024 * 1024,
            blob_get_attempts: 3,
            blob_backoff_base: Duration::from_secs(2),
            summary_concurrency: 2,
            temp_dir: env::temp_dir(),
            blob_dir: None,
            log_file: None,
            ai_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            ai_model: "gpt-4o-mini".to_string(),
            ai_api_key: None,
            ocr_endpoint: "https://api.ocr.space/parse/image".to_string(),
            ocr_api_key: None,
        }
    }
}

impl ProcessingConfig {
    /// Build the configuration from `LAB_REPORT_*` environment variables,
    /// falling back to defaults for anything unset or unparsable
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_file_size: env_parse("LAB_REPORT_MAX_FILE_SIZE").unwrap_or(defaults.max_file_size),
            min_text_length: env_parse("LAB_REPORT_MIN_TEXT_LENGTH").unwrap_or(defaults.min_text_length),
            chunk_token_budget: env_parse("LAB_REPORT_CHUNK_TOKENS").unwrap_or(defaults.chunk_token_budget),
            capability_timeout: env_parse("LAB_REPORT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.capability_timeout),
            ocr_language: env::var("LAB_REPORT_OCR_LANGUAGE").unwrap_or(defaults.ocr_language),
            split_pages_per_part: env_parse("LAB_REPORT_SPLIT_PAGES").unwrap_or(defaults.split_pages_per_part),
            external_tools_enabled: !is_constrained_environment()
                && env_parse::<bool>("LAB_REPORT_EXTERNAL_TOOLS").unwrap_or(defaults.external_tools_enabled),
            summary_concurrency: env_parse("LAB_REPORT_SUMMARY_CONCURRENCY").unwrap_or(defaults.summary_concurrency),
            temp_dir: env::var("LAB_REPORT_TEMP_DIR").map(PathBuf::from).unwrap_or(defaults.temp_dir),
            blob_dir: env::var("LAB_REPORT_BLOB_DIR").ok().filter(|d| !d.is_empty()).map(PathBuf::from),
            inline_processing_limit: env_parse("LAB_REPORT_INLINE_LIMIT").unwrap_or(defaults.inline_processing_limit),
            log_file: env::var("LAB_REPORT_LOG_FILE").ok().map(PathBuf::from),
            ai_endpoint: env::var("LAB_REPORT_AI_ENDPOINT").unwrap_or(defaults.ai_endpoint),
            ai_model: env::var("LAB_REPORT_AI_MODEL").unwrap_or(defaults.ai_model),
            ai_api_key: env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            ocr_endpoint: env::var("LAB_REPORT_OCR_ENDPOINT").unwrap_or(defaults.ocr_endpoint),
            ocr_api_key: env::var("OCR_SPACE_API_KEY").ok().filter(|k| !k.is_empty()),
            ..defaults
        }
    }

    /// Maximum characters per summarizer chunk
    pub fn chunk_chars(&self) -> usize {
        (self.chunk_token_budget * self.chars_per_token).max(1)
    }
}

/// Serverless platforms do not allow spawning Ghostscript
pub fn is_constrained_environment() -> bool {
    CONSTRAINED_ENV_MARKERS.iter().any(|marker| env::var_os(marker).is_some())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
