use thiserror::Error;

/// Failures of the voting core. The `Display` strings of the access-control variants are shown to
/// users as-is.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Voter not registered")]
    NotRegistered,

    #[error("Please enter a token")]
    EmptyToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token already used on another device")]
    TokenBoundElsewhere,

    #[error("Request timed out")]
    TokenLookupTimeout,

    #[error("Not connected to server")]
    StoreUnavailable(String),

    #[error("Email {0} is already linked to another voter")]
    LinkConflict(String),

    #[error("Failed to register device: {0}")]
    RegistrationFailed(String),

    #[error("Only the control panel can change the live state")]
    NotControlPanel,

    #[error("Store error: {0}")]
    Store(#[from] diesel::result::Error),

    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}

impl From<diesel::r2d2::PoolError> for AppError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
