use std::path::Path;

use flexi_logger::{Age, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

use crate::config::LoggingConfig;
use crate::error::MentorLoopError;

const LOG_BASENAME: &str = "mentorloop";
const LOG_FILES_KEPT: usize = 7;

/// Start file logging in `log_dir` at the configured level. `RUST_LOG` wins
/// when set. Errors are also echoed to stderr.
///
/// Keep the returned handle alive for the life of the process.
pub fn setup_logging(config: &LoggingConfig, log_dir: &Path) -> Result<LoggerHandle, MentorLoopError> {
    let spec = log_spec(config);

    Logger::try_with_env_or_str(&spec)
        .and_then(|logger| {
            logger
                .log_to_file(
                    FileSpec::default()
                        .directory(log_dir)
                        .basename(LOG_BASENAME),
                )
                .rotate(
                    Criterion::Age(Age::Day),
                    Naming::Timestamps,
                    Cleanup::KeepLogFiles(LOG_FILES_KEPT),
                )
                .duplicate_to_stderr(Duplicate::Error)
                .append()
                .start()
        })
        .map_err(|e| MentorLoopError::Error(format!("Failed to start logging: {}", e)))
}

fn log_spec(config: &LoggingConfig) -> String {
    format!("warn, {}={}", LOG_BASENAME, config.mentorloop)
}
