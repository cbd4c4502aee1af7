//! Error types for the simulation.
//!
//! Every failure here is a usage error in the test or the code under test:
//! nothing is transient and nothing is retried. Quiescent operations such as
//! posting to a quit looper or cancelling an absent alarm are not errors and
//! never surface through this type.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected input such as a negative delay or interval.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Lifecycle transition the platform forbids, e.g. quitting the main looper.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Configuration value that could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A scenario step whose observed outcome differs from the expected one.
    #[error("Expectation failed: {0}")]
    Expectation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn expectation(message: impl Into<String>) -> Self {
        Self::Expectation(message.into())
    }

    /// Returns true for errors caused by a forbidden lifecycle transition.
    #[must_use]
    pub const fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }

    /// Returns true for errors caused by rejected input.
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}
