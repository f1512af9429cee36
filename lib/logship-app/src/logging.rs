//! Logging.

use logship_error::{ErrorContext as _, GenericError};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer as _};

const LOG_LEVEL_ENV_VAR: &str = "LOGSHIP_LOG_LEVEL";
const LOG_FORMAT_JSON_ENV_VAR: &str = "LOGSHIP_LOG_FORMAT_JSON";

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// Filtering directives are read from the `LOGSHIP_LOG_LEVEL` environment variable, falling back to `default_level`
/// when it is not set. When `LOGSHIP_LOG_FORMAT_JSON` is set to `true` or `1`, logs are written as JSON. Otherwise, a
/// human-readable format is used.
///
/// Logs are written to standard output from a background thread. The returned guard flushes any buffered logs when
/// dropped, and must be held for as long as the process logs.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: LevelFilter) -> Result<WorkerGuard, GenericError> {
    let is_json = std::env::var(LOG_FORMAT_JSON_ENV_VAR)
        .map(|value| is_json_format(&value))
        .unwrap_or(false);

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    if is_json {
        let json_layer = tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(json_layer.with_filter(level_filter))
            .try_init()
            .error_context("Failed to install logging subscriber.")?;
    } else {
        let pretty_layer = tracing_subscriber::fmt::Layer::new()
            .with_target(true)
            .with_ansi(true)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(pretty_layer.with_filter(level_filter))
            .try_init()
            .error_context("Failed to install logging subscriber.")?;
    }

    Ok(guard)
}

fn is_json_format(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value == "true" || value == "1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_format_flag() {
        assert!(is_json_format("true"));
        assert!(is_json_format(" TRUE "));
        assert!(is_json_format("1"));
        assert!(!is_json_format("json"));
        assert!(!is_json_format("0"));
        assert!(!is_json_format(""));
    }
}
