//! Error types for the escrow service

use crate::coordination::{RequestId, RequestStatus};

use thiserror::Error;

/// Main error type for the escrow service
#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request {request_id} not found")]
    NotFound { request_id: RequestId },

    #[error("Request {request_id} is {status}, operation not allowed")]
    InvalidState {
        request_id: RequestId,
        status: RequestStatus,
    },

    #[error("Request {request_id} has already been claimed")]
    AlreadyClaimed { request_id: RequestId },

    #[error("Foreign chain verification failed transiently: {0}")]
    VerificationTransient(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EscrowError::VerificationTransient(_)
                | EscrowError::Database(_)
                | EscrowError::Storage(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(self, EscrowError::Ledger(_) | EscrowError::Storage(_))
    }

    /// Whether the error belongs to the caller-facing validation taxonomy
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EscrowError::InvalidRequest(_)
                | EscrowError::NotFound { .. }
                | EscrowError::InvalidState { .. }
                | EscrowError::AlreadyClaimed { .. }
        )
    }
}

/// Result type for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
