use std::path::{Path, PathBuf};

use clap::Parser;
use logship_config::Configuration;
use logship_error::{ErrorContext as _, GenericError};

#[derive(Clone, Parser)]
#[command(about)]
pub struct Cli {
    /// Path to the configuration file.
    ///
    /// Each line holds a key followed by its value, separated by whitespace. Blank lines, lines starting with `#` and
    /// section headers such as `[OUTPUT]` are ignored.
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
}

/// Loads the configuration from the file at `path`.
///
/// # Errors
///
/// If the file cannot be read, or holds an invalid configuration, an error is returned.
pub fn load_configuration(path: &Path) -> Result<Configuration, GenericError> {
    let contents = std::fs::read_to_string(path)
        .with_error_context(|| format!("Failed to read configuration file '{}'.", path.display()))?;

    Configuration::from_pairs(parse_pairs(&contents))
        .with_error_context(|| format!("Invalid configuration in '{}'.", path.display()))
}

fn parse_pairs(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('['))
        .map(|line| match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key.to_string(), value.trim().to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{io::Write as _, time::Duration};

    use super::*;

    #[test]
    fn pairs_skip_comments_and_sections() {
        let contents = r#"
            [OUTPUT]
            # Where logs go.
            URL   http://loki:3100/loki/api/v1/push
            Labels {job="fluent-bit", env="prod"}
            TenantID
        "#;

        assert_eq!(
            parse_pairs(contents),
            vec![
                ("URL".to_string(), "http://loki:3100/loki/api/v1/push".to_string()),
                ("Labels".to_string(), r#"{job="fluent-bit", env="prod"}"#.to_string()),
                ("TenantID".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn configuration_is_loaded_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "URL http://loki:3100/loki/api/v1/push").unwrap();
        writeln!(file, "BatchWait 5s").unwrap();

        let config = load_configuration(file.path()).unwrap();
        assert_eq!(config.client.url.as_str(), "http://loki:3100/loki/api/v1/push");
        assert_eq!(config.client.batch_wait, Duration::from_secs(5));
    }

    #[test]
    fn invalid_files_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "BatchWait soon").unwrap();
        assert!(load_configuration(file.path()).is_err());

        assert!(load_configuration(Path::new("/nonexistent/logship.conf")).is_err());
    }
}
