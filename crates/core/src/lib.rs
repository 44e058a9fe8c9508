pub mod audit;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod pricing;
pub mod query;
pub mod service;
pub mod store;

pub use audit::{
    AuditAction, AuditCursor, AuditEntry, AuditFilter, AuditLog, AuditLogId, AuditMetadata,
    AuditPosition, AuditRecorder, DateRange,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::actor::{Actor, Capability, SYSTEM_ACTOR_ID};
pub use domain::quote::{
    NewQuote, NewQuoteItem, Quote, QuoteDetailsPatch, QuoteId, QuoteItem, QuoteItemId,
    QuoteItemPatch, QuoteStatus,
};
pub use errors::{ApplicationError, DomainError, ErrorKind};
pub use lifecycle::{StatusChange, TransitionRejection, TransitionTrigger};
pub use pricing::{compute_item_total, compute_quote_total, price_breakdown, PriceBreakdown};
pub use query::{
    ListParams, PageRequest, PaginatedResponse, QuoteFilters, QuoteQuery, SortDirection,
    SortField, Sorting,
};
pub use service::{ExpirySweep, QuoteService, ServiceSettings};
pub use store::{AuditStore, QuoteCommit, QuoteStore, QuoteWrite, StoreError};
