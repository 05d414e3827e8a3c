//! Configuration validation

use crate::schema::RawConfig;
use std::path::Path;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("[server] {0}")]
    ServerError(String),

    #[error("[client] {0}")]
    ClientError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let server = &config.server;
    if server.job_timeout_seconds == Some(0) {
        errors.push(ValidationError::ServerError(
            "job_timeout_seconds must be greater than 0".into(),
        ));
    }
    if server.socket_path.as_deref().is_some_and(is_empty_path) {
        errors.push(ValidationError::ServerError("socket_path cannot be empty".into()));
    }
    if server.data_dir.as_deref().is_some_and(is_empty_path) {
        errors.push(ValidationError::ServerError("data_dir cannot be empty".into()));
    }

    let client = &config.client;
    if client.flush_threshold == Some(0) {
        errors.push(ValidationError::ClientError(
            "flush_threshold must be at least 1".into(),
        ));
    }
    if client.socket_path.as_deref().is_some_and(is_empty_path) {
        errors.push(ValidationError::ClientError("socket_path cannot be empty".into()));
    }
    if client.data_dir.as_deref().is_some_and(is_empty_path) {
        errors.push(ValidationError::ClientError("data_dir cannot be empty".into()));
    }

    errors
}

fn is_empty_path(path: &Path) -> bool {
    path.as_os_str().is_empty()
}
