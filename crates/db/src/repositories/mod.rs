use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use quotedesk_core::store::StoreError;

pub mod audit;
pub mod memory;
pub mod quote;

pub use memory::InMemoryQuoteStore;
pub use quote::SqlQuoteStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Store(error) => error,
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Fixed-width RFC 3339 so text comparison in SQL matches time order.
pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_decimal(column: &str, value: String) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(&value).map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use quotedesk_core::domain::quote::QuoteId;
    use quotedesk_core::store::StoreError;

    use super::{format_timestamp, parse_timestamp, RepositoryError};

    #[test]
    fn contract_errors_pass_through_unchanged() {
        let conflict =
            StoreError::VersionConflict { id: QuoteId("Q-1".to_string()), expected: 2, actual: 3 };
        let mapped = StoreError::from(RepositoryError::from(conflict.clone()));
        assert_eq!(mapped, conflict);

        let decode = StoreError::from(RepositoryError::Decode("bad row".to_string()));
        assert!(matches!(decode, StoreError::Unavailable(message) if message.contains("bad row")));
    }

    #[test]
    fn timestamps_sort_as_text() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("time");
        let later = earlier + chrono::Duration::microseconds(1);

        let (a, b) = (format_timestamp(&earlier), format_timestamp(&later));
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert_eq!(parse_timestamp("at", a).expect("parse"), earlier);
    }
}
