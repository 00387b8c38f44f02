use std::time::Duration;

use thiserror::Error;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// Malformed instruction operands
    #[error("Syntax error on line {line}: {message} (expected `{expected}`)")]
    Syntax {
        line: usize,
        message: String,
        expected: String,
    },

    /// Keyword not recognized by the recipe parser
    #[error("Unknown instruction '{keyword}' on line {line}")]
    UnknownInstruction { line: usize, keyword: String },

    /// FROM could not be resolved through the registry
    #[error("Step {step} (line {line}): base image not found: {reference}")]
    BaseImageNotFound {
        step: usize,
        line: usize,
        reference: String,
    },

    /// COPY referenced a path missing from the build context
    #[error("Step {step} (line {line}): COPY source not found in build context: {path}")]
    SourceNotFound {
        step: usize,
        line: usize,
        path: String,
    },

    /// RUN exited with a non-zero status
    #[error("Step {step} (line {line}): RUN `{command}` failed with exit code {exit_code}")]
    RunCommandFailed {
        step: usize,
        line: usize,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// RUN exceeded the caller's deadline
    #[error("Step {step} (line {line}): RUN `{command}` timed out after {timeout:?}")]
    Timeout {
        step: usize,
        line: usize,
        command: String,
        timeout: Duration,
    },

    /// USER or `COPY --chown` named an identity the rootfs does not define
    #[error("Step {step} (line {line}): cannot resolve user '{spec}': {reason}")]
    UnknownIdentity {
        step: usize,
        line: usize,
        spec: String,
        reason: String,
    },

    /// Image assembly could not satisfy a requirement
    #[error("Incomplete image: {0}")]
    IncompleteImage(String),

    /// A volume with this name already exists
    #[error("Volume '{0}' already exists")]
    DuplicateVolume(String),

    /// Volume still has live attachments
    #[error("Volume '{name}' is in use by {attachments} container(s)")]
    VolumeInUse { name: String, attachments: usize },

    /// Volume lookup failed
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    /// Image lookup failed
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Container run configuration rejected
    #[error("Invalid run configuration: {0}")]
    InvalidRunConfig(String),

    /// Sandbox could not be prepared or torn down
    #[error("Sandbox error: {0}")]
    SandboxError(String),

    /// Layer cache failure
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Persistent store failure
    #[error("Store error: {0}")]
    StoreError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// Whether the caller can retry after changing its inputs
    /// (a different volume name, or after detaching).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StrataError::DuplicateVolume(_) | StrataError::VolumeInUse { .. }
        )
    }

    /// Build step (1-based) the error was raised at, if any.
    pub fn step(&self) -> Option<usize> {
        match self {
            StrataError::BaseImageNotFound { step, .. }
            | StrataError::SourceNotFound { step, .. }
            | StrataError::RunCommandFailed { step, .. }
            | StrataError::Timeout { step, .. }
            | StrataError::UnknownIdentity { step, .. } => Some(*step),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for StrataError {
    fn from(err: serde_yaml::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
