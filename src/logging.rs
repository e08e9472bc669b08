use std::path::Path;

use anyhow::{Context, Result};

/// Initialise the global logger.
///
/// With a log file, a `fern` dispatch writes timestamped lines to both stderr
/// and the file. Without one, `env_logger` is used and honours `RUST_LOG`.
pub fn init_logging(log_file: Option<&Path>) -> Result<()> {
    match log_file {
        Some(path) => {
            let level = std::env::var("RUST_LOG")
                .ok()
                .and_then(|value| value.parse::<log::LevelFilter>().ok())
                .unwrap_or(log::LevelFilter::Info);

            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!(
                        "{} [{}] {}: {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                        record.level(),
                        record.target(),
                        message
                    ))
                })
                .level(level)
                .chain(std::io::stderr())
                .chain(fern::log_file(path).with_context(|| format!("Failed to open log file: {}", path.display()))?)
                .apply()
                .context("Logger already initialised")?;
        }
        None => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .try_init()
                .context("Logger already initialised")?;
        }
    }

    Ok(())
}

/// Idempotent logger setup for tests
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
