//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ABI error: {0}")]
    Abi(#[from] alloy_sol_types::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Transaction {0} reverted")]
    Reverted(String),

    #[error("Timed out waiting for receipt of {0}")]
    ReceiptTimeout(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl AppError {
    /// Whether the error originated on the chain side (transport, RPC or execution).
    pub fn is_chain(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Abi(_)
                | Self::Rpc { .. }
                | Self::Reverted(_)
                | Self::ReceiptTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
