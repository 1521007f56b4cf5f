//! Error types for sure-ei-rs.
//!
//! Configuration and validation problems are raised eagerly when components
//! are built; shape problems are raised at the operation that detects them.
//! A divergent training loss is not an error unless the run is configured to
//! halt on divergence.
//!
//! # Example
//!
//! ```rust
//! use sure_ei_rs::{RestoreError, Result};
//!
//! fn check_tau(tau: f64) -> Result<()> {
//!     if tau <= 0.0 {
//!         return Err(RestoreError::validation(format!("tau must be positive, got {tau}")));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_tau(0.0).is_err());
//! assert!(check_tau(0.01).is_ok());
//! ```

use thiserror::Error;

/// Result type alias for sure-ei-rs operations.
pub type Result<T> = std::result::Result<T, RestoreError>;

/// Errors that can occur in sure-ei-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RestoreError {
    /// Configuration error: unknown task, method, transform or device,
    /// missing kernel, unsupported loss/physics pairing.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A value is outside its admissible range (sigma, tau, crop margin, weight).
    #[error("validation error: {0}")]
    Validation(String),

    /// Tensor shapes are incompatible with the requested operation.
    #[error("shape error: expected {expected}, got {got}")]
    Shape {
        /// What the operation needed
        expected: String,
        /// What it was given
        got: String,
    },

    /// Blur kernel could not be loaded or is malformed.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl RestoreError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a shape error
    pub fn shape(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::Shape {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a kernel error
    pub fn kernel(msg: impl Into<String>) -> Self {
        Self::Kernel(msg.into())
    }

    /// Create a dataset error
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }
}

impl From<indicatif::style::TemplateError> for RestoreError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        RestoreError::Template(err.to_string())
    }
}
