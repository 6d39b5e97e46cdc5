//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges and cross-field requirements
//! - Check the selected store backend has what it needs
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::{AppConfig, StoreBackend};

/// One semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("no listener enabled: set server.http_port or server.https_port")]
    NoListener,
    #[error("server.context_path must start with '/'")]
    ContextPathNotAbsolute,
    #[error("server.max_connections must be greater than zero")]
    ZeroConnectionLimit,
    #[error("store.relational.url is required for the relational backend")]
    MissingDatabaseUrl,
    #[error("store.relational.table must not be empty")]
    EmptyTableName,
    #[error("store.kv.host must not be empty")]
    EmptyKvHost,
    #[error("session.cookie.name must not be empty")]
    EmptyCookieName,
    #[error("tls.key_file is set but tls.cert_files is empty")]
    KeyWithoutCertificates,
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.http_port.is_none() && config.server.https_port.is_none() {
        errors.push(ValidationError::NoListener);
    }
    if !config.server.context_path.starts_with('/') {
        errors.push(ValidationError::ContextPathNotAbsolute);
    }
    if config.server.max_connections == 0 {
        errors.push(ValidationError::ZeroConnectionLimit);
    }

    match config.store.backend {
        StoreBackend::Relational => {
            if config.store.relational.url.is_empty() {
                errors.push(ValidationError::MissingDatabaseUrl);
            }
            if config.store.relational.table.is_empty() {
                errors.push(ValidationError::EmptyTableName);
            }
        }
        StoreBackend::KeyValue => {
            if config.store.kv.host.is_empty() {
                errors.push(ValidationError::EmptyKvHost);
            }
        }
    }

    if config.session.cookie.name.is_empty() {
        errors.push(ValidationError::EmptyCookieName);
    }
    if config.tls.key_file.is_some() && config.tls.cert_files.is_empty() {
        errors.push(ValidationError::KeyWithoutCertificates);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
