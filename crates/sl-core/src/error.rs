//! Error types for sl-core

use thiserror::Error;

/// Core error type for Sluice
#[derive(Error, Debug)]
pub enum CoreError {
    /// E001: Configuration file not found
    #[error("[E001] Config file not found: {path}")]
    ConfigNotFound { path: String },

    /// E002: Failed to parse configuration file
    #[error("[E002] Failed to parse config {path}: {message}")]
    ConfigParseError { path: String, message: String },

    /// E003: Invalid configuration value
    #[error("[E003] Invalid config for '{node}': {message}")]
    ConfigInvalid { node: String, message: String },

    /// E007: Circular dependency detected
    #[error("[E007] Circular dependency detected: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<String> },

    /// E008: Two nodes share the same fully-qualified id
    #[error("[E008] Duplicate node id: {id}")]
    DuplicateNode { id: String },

    /// E014: IO error
    #[error("[E014] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// E015: YAML parse error
    #[error("[E015] YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// E016: IO error with file path context
    #[error("[E016] Failed to read '{path}': {source}")]
    IoWithPath {
        path: String,
        source: std::io::Error,
    },

    /// E017: Template variables without a supplied value
    #[error("[E017] Unresolved template variable(s) in '{node}': {}", .missing.join(", "))]
    VariableSubstitution { node: String, missing: Vec<String> },

    /// E018: Recorded strategy differs from the configured one and policy is `error`
    #[error("[E018] Strategy mismatch for '{node}': state recorded '{recorded}', config declares '{configured}'")]
    StrategyMismatch {
        node: String,
        recorded: String,
        configured: String,
    },

    /// E019: A watermark value could not be parsed for its column type
    #[error("[E019] Invalid {column_type} watermark '{value}'")]
    InvalidWatermark { value: String, column_type: String },

    /// E020: A lookback window could not be parsed
    #[error("[E020] Invalid lookback window '{value}': {reason}")]
    InvalidLookback { value: String, reason: String },

    /// E021: An id or reference was empty
    #[error("[E021] Empty name in {context}")]
    EmptyName { context: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// State store backend failure
    #[error("[E022] State store error: {0}")]
    StateStore(String),
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::from("<unknown>"),
    }
}

/// Result type alias for CoreError
pub type CoreResult<T> = Result<T, CoreError>;
