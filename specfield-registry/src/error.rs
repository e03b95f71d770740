//! Error types for the field registry

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, FieldsError>;

/// Errors that can occur in field registry operations
#[derive(Debug, Error)]
pub enum FieldsError {
    /// A load/register/update/remove round-trip through the store failed
    #[error("registry operation '{operation}' failed: {source}")]
    Registry {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// A field configuration was rejected at registration time
    #[error(transparent)]
    Configuration(#[from] FieldConfigurationError),

    /// Schema assembly failed for a category
    #[error("form generation failed for category '{category_id}': {message}")]
    FormGeneration {
        category_id: String,
        message: String,
    },

    /// Field not found by id
    #[error("field not found: {id}")]
    FieldNotFound { id: String },

    /// Engine configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl FieldsError {
    pub(crate) fn registry(operation: &'static str, source: StoreError) -> Self {
        FieldsError::Registry { operation, source }
    }
}

/// Errors reported by the external document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {id}")]
    NotFound { id: String },

    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    #[error("conflicting write: {message}")]
    Conflict { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Machine-readable reason a field configuration was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigurationErrorCode {
    InvalidKey,
    InvalidType,
    MissingOptions,
    InvalidBounds,
    ConditionalDepthExceeded,
    DuplicateKey,
}

impl ConfigurationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationErrorCode::InvalidKey => "invalid_key",
            ConfigurationErrorCode::InvalidType => "invalid_type",
            ConfigurationErrorCode::MissingOptions => "missing_options",
            ConfigurationErrorCode::InvalidBounds => "invalid_bounds",
            ConfigurationErrorCode::ConditionalDepthExceeded => "conditional_depth_exceeded",
            ConfigurationErrorCode::DuplicateKey => "duplicate_key",
        }
    }
}

impl fmt::Display for ConfigurationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field definition that cannot be registered.
///
/// Only the offending field is rejected; the rest of a batch proceeds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid field configuration '{key}' ({code}): {message}")]
pub struct FieldConfigurationError {
    pub key: String,
    pub code: ConfigurationErrorCode,
    pub message: String,
}

impl FieldConfigurationError {
    pub fn new(
        key: impl Into<String>,
        code: ConfigurationErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            code,
            message: message.into(),
        }
    }
}

/// A type name outside the ten supported field types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown field type: {0}")]
pub struct UnknownFieldType(pub String);

/// Engine configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// Configuration parsing failed
    #[error("failed to parse configuration: {source}")]
    ParseError {
        #[source]
        source: Box<figment::Error>,
    },

    /// Invalid configuration value
    #[error("invalid configuration value for key '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        ConfigError::ParseError {
            source: Box::new(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_names_operation() {
        let err = FieldsError::registry(
            "fetch_field_groups",
            StoreError::Unavailable {
                message: "connection reset".into(),
            },
        );
        let text = err.to_string();
        assert!(text.contains("fetch_field_groups"));
        assert!(text.contains("connection reset"));
    }

    #[test]
    fn test_configuration_error_display() {
        let err = FieldConfigurationError::new(
            "amperage",
            ConfigurationErrorCode::DuplicateKey,
            "key already registered",
        );
        assert_eq!(
            err.to_string(),
            "invalid field configuration 'amperage' (duplicate_key): key already registered"
        );
    }

    #[test]
    fn test_configuration_error_converts() {
        let err: FieldsError = FieldConfigurationError::new(
            "x",
            ConfigurationErrorCode::MissingOptions,
            "no options",
        )
        .into();
        assert!(matches!(
            err,
            FieldsError::Configuration(FieldConfigurationError {
                code: ConfigurationErrorCode::MissingOptions,
                ..
            })
        ));
    }
}
