//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::AppConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", format_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nhttp_port = 9090").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.http_port, Some(9090));
        assert_eq!(config.server.context_path, "/");
    }

    #[test]
    fn surfaces_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server = not toml").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn surfaces_validation_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ncontext_path = \"app\"").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Validation(_))
        ));
    }
}
