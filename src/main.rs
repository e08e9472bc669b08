use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::runtime::Runtime;

use lab_report_reader::capabilities::Capabilities;
use lab_report_reader::logging::init_logging;
use lab_report_reader::{DocumentSource, LabReportService, ProcessingConfig};

fn main() -> Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("Usage: lab_report_reader <report.pdf>")?;

    let config = ProcessingConfig::from_env();
    init_logging(config.log_file.as_deref())?;

    let capabilities = Capabilities::from_config(&config)?;
    let service = LabReportService::new(config, capabilities);

    // Create a Tokio runtime for the async pipeline
    let rt = Runtime::new()?;

    let response = rt
        .block_on(service.process(DocumentSource::Path(path.clone())))
        .with_context(|| format!("Failed to process {}", path.display()))?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
