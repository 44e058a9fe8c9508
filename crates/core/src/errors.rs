use serde::Serialize;
use thiserror::Error;

use crate::domain::actor::Capability;
use crate::domain::quote::{QuoteId, QuoteStatus};
use crate::lifecycle::TransitionRejection;
use crate::store::StoreError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },
    #[error("invalid quote transition from {from} to {to}: {reason}")]
    InvalidQuoteTransition { from: QuoteStatus, to: QuoteStatus, reason: TransitionRejection },
    #[error("quote {id} is locked in status {status}")]
    QuoteLocked { id: QuoteId, status: QuoteStatus },
}

impl DomainError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("quote {0} was not found")]
    NotFound(QuoteId),
    #[error("actor `{actor_id}` lacks the `{capability}` capability")]
    Unauthorized { actor_id: String, capability: Capability },
    #[error("quote {id} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrentModification { id: QuoteId, expected: u32, actual: u32 },
    #[error("audit write failed: {0}")]
    AuditWrite(String),
    #[error("store call `{operation}` timed out after {timeout_ms}ms")]
    StoreTimeout { operation: &'static str, timeout_ms: u64 },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Stable classification handed to the presentation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidTransition,
    QuoteLocked,
    NotFound,
    Unauthorized,
    ConcurrentModification,
    AuditWrite,
    StoreTimeout,
    StoreUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::InvalidTransition => "invalid_transition",
            Self::QuoteLocked => "quote_locked",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::ConcurrentModification => "concurrent_modification",
            Self::AuditWrite => "audit_write",
            Self::StoreTimeout => "store_timeout",
            Self::StoreUnavailable => "store_unavailable",
        }
    }

    /// Retryable kinds are infrastructure or version races; everything else
    /// needs the caller to change its input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification
                | Self::AuditWrite
                | Self::StoreTimeout
                | Self::StoreUnavailable
        )
    }
}

impl ApplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Domain(DomainError::Validation { .. }) => ErrorKind::Validation,
            Self::Domain(DomainError::InvalidQuoteTransition { .. }) => {
                ErrorKind::InvalidTransition
            }
            Self::Domain(DomainError::QuoteLocked { .. }) => ErrorKind::QuoteLocked,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            Self::AuditWrite(_) => ErrorKind::AuditWrite,
            Self::StoreTimeout { .. } => ErrorKind::StoreTimeout,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::VersionConflict { id, expected, actual } => {
                Self::ConcurrentModification { id, expected, actual }
            }
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::AlreadyExists(id) => Self::Domain(DomainError::validation(
                "id",
                format!("quote {id} already exists"),
            )),
            StoreError::AuditAppend(message) => Self::AuditWrite(message),
            StoreError::Unavailable(message) => Self::StoreUnavailable(message),
        }
    }
}
