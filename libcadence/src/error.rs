//! Error types for Cadence

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CadenceError>;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadenceError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CadenceError::InvalidInput(_) => 3,
            CadenceError::Config(_) => 2,
            CadenceError::Vault(VaultError::Key(_)) => 2,
            CadenceError::Vault(_) => 1,
            CadenceError::Platform(_) => 1,
            CadenceError::Database(_) => 1,
            CadenceError::Account(_) => 1,
            CadenceError::Io(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unexpected value in column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}

/// Failures of the credential vault.
///
/// `Key` is a configuration problem and is fatal at startup; the other two
/// are per-token failures.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Encryption key unavailable: {0}")]
    Key(String),

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Account not found: {0}")]
    NotFound(String),

    #[error("Account {0} is disconnected")]
    Disconnected(String),

    #[error("Account {0} has no refresh token")]
    NoRefreshToken(String),
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Platform not configured: {0}")]
    NotConfigured(String),
}

impl PlatformError {
    /// Classify the error for the retry machinery.
    ///
    /// Every variant maps to exactly one class. Network failures and server
    /// errors are retried, 429s wait out a cool-down, everything else is final.
    pub fn class(&self) -> ErrorClass {
        match self {
            PlatformError::Network(_) => ErrorClass::Transient,
            PlatformError::RateLimit { .. } => ErrorClass::RateLimited,
            PlatformError::Authentication(_)
            | PlatformError::Validation(_)
            | PlatformError::Posting(_)
            | PlatformError::NotConfigured(_) => ErrorClass::Permanent,
        }
    }

    /// Platform-specified cool-down, if the platform sent one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// True when the platform rejected the grant itself (401/403)
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, PlatformError::Authentication(_))
    }
}

/// Retry classification shared by all platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    RateLimited,
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Permanent => "permanent",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorClass::Transient),
            "rate_limited" => Ok(ErrorClass::RateLimited),
            "permanent" => Ok(ErrorClass::Permanent),
            other => Err(format!("unknown error class '{}'", other)),
        }
    }
}
