//! Contract between the core and a backing store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::audit::{AuditFilter, AuditLog, AuditPosition};
use crate::domain::quote::{Quote, QuoteId};
use crate::errors::ApplicationError;
use crate::query::{PaginatedResponse, QuoteQuery};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("quote {id} is at version {actual}, expected {expected}")]
    VersionConflict { id: QuoteId, expected: u32, actual: u32 },
    #[error("quote {0} not found")]
    NotFound(QuoteId),
    #[error("quote {0} already exists")]
    AlreadyExists(QuoteId),
    #[error("audit append failed: {0}")]
    AuditAppend(String),
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuoteWrite {
    Insert(Quote),
    Update { quote: Quote, expected_version: u32 },
    Delete { id: QuoteId, expected_version: u32 },
}

/// One unit of work: the aggregate write and its audit record commit together
/// or not at all.
#[derive(Clone, Debug, PartialEq)]
pub struct QuoteCommit {
    pub write: QuoteWrite,
    pub audit: AuditLog,
}

#[async_trait]
pub trait QuoteStore: Send + Sync {
    async fn load_quote(&self, id: &QuoteId) -> Result<Option<Quote>, StoreError>;

    /// Applies the write and appends the audit record atomically. `Update` and
    /// `Delete` fail with `VersionConflict` when the stored version differs.
    async fn commit(&self, commit: QuoteCommit) -> Result<(), StoreError>;

    async fn list_quotes(&self, query: &QuoteQuery)
        -> Result<PaginatedResponse<Quote>, StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, log: AuditLog) -> Result<(), StoreError>;

    /// Up to `limit` matching records strictly after `after`, ordered by
    /// `(timestamp desc, id desc)`.
    async fn scan_audit(
        &self,
        filter: &AuditFilter,
        after: Option<&AuditPosition>,
        limit: u32,
    ) -> Result<Vec<AuditLog>, StoreError>;
}

pub(crate) async fn call_store<T, F>(
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, ApplicationError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(ApplicationError::from),
        Err(_) => {
            tracing::warn!(
                event_name = "store.call_timed_out",
                operation,
                timeout_ms = timeout.as_millis() as u64,
                "backing store call timed out"
            );
            Err(ApplicationError::StoreTimeout {
                operation,
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}
