use std::fmt;

use thiserror::Error;

/// Error reported by a database driver.
///
/// Keeps the driver's message and, when the server produced one, its SQLSTATE
/// code so callers can still tell a unique violation from a syntax error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    message: String,
    code: Option<String>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Attach a SQLSTATE code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The SQLSTATE code, if the error came from the server.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (SQLSTATE {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl From<postgres::Error> for DriverError {
    fn from(err: postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => DriverError::new(db.message()).with_code(db.code().code()),
            None => DriverError::new(err.to_string()),
        }
    }
}

/// Error type for pgtask operations
#[derive(Debug, Error)]
pub enum PgTaskError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(DriverError),

    #[error("Query failed: {0}")]
    QueryFailed(DriverError),

    #[error("Fetch failed: {0}")]
    FetchFailed(DriverError),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl PgTaskError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(err: impl Into<DriverError>) -> Self {
        Self::ConnectionFailed(err.into())
    }

    pub fn query(err: impl Into<DriverError>) -> Self {
        Self::QueryFailed(err.into())
    }

    pub fn fetch(err: impl Into<DriverError>) -> Self {
        Self::FetchFailed(err.into())
    }

    /// Returns the error kind as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "Configuration Error",
            Self::ConnectionFailed(_) => "Connection Error",
            Self::QueryFailed(_) => "Query Execution Error",
            Self::FetchFailed(_) => "Fetch Error",
            Self::Worker(_) => "Worker Error",
        }
    }

    /// The underlying driver error, for the kinds that carry one.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::ConnectionFailed(e) | Self::QueryFailed(e) | Self::FetchFailed(e) => Some(e),
            Self::Configuration(_) | Self::Worker(_) => None,
        }
    }
}

impl From<&str> for DriverError {
    fn from(message: &str) -> Self {
        DriverError::new(message)
    }
}

impl From<String> for DriverError {
    fn from(message: String) -> Self {
        DriverError::new(message)
    }
}

/// Result type alias for pgtask operations
pub type Result<T> = std::result::Result<T, PgTaskError>;
