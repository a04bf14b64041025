//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout Regrant.
//! All errors are structured and map to specific error codes for
//! programmatic handling by callers.
//!
//! # Error Categories
//! - `ConnectionFailed`: transport/auth failure or retry-budget exhaustion
//! - `ParseFailed`: the server's grant listing could not be parsed
//! - `InvalidInput`: caller-supplied state failed validation before any SQL was built
//! - `ExecutionFailed`: the server rejected a GRANT/REVOKE/ALTER statement

use thiserror::Error;

/// Main error type for Regrant operations
#[derive(Error, Debug)]
pub enum RegrantError {
    /// Database connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A grant-listing line could not be parsed
    #[error("Failed to parse grant statement `{line}`: {detail}")]
    ParseFailed { line: String, detail: String },

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The server rejected a statement
    #[error("Statement execution failed ({statement}): {detail}")]
    ExecutionFailed { statement: String, detail: String },
}

impl RegrantError {
    /// Convert error to error code string
    ///
    /// Error codes are stable and suitable for programmatic handling by callers.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::ParseFailed { .. } => "PARSE_FAILED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::ExecutionFailed { .. } => "EXECUTION_FAILED",
        }
    }

    /// Get human-readable error message
    ///
    /// The message carries enough context (offending line, statement text,
    /// bound scope) to log or surface to an operator. It never contains
    /// credentials.
    #[must_use]
    pub fn message(&self) -> String {
        // Use Display implementation from thiserror
        self.to_string()
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a parse error carrying the offending line verbatim
    pub fn parse_failed(line: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ParseFailed { line: line.into(), detail: detail.into() }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an execution error carrying the statement text
    pub fn execution_failed(statement: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ExecutionFailed { statement: statement.into(), detail: detail.into() }
    }
}

/// Result type alias for Regrant operations
pub type Result<T> = std::result::Result<T, RegrantError>;
