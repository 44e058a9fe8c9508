//! Application service for the quote lifecycle.
//!
//! Every mutation follows the same path: load the aggregate, apply the domain
//! change, stamp one audit record, and hand both to the store as a single
//! version-checked commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditCursor, AuditEntry, AuditFilter, AuditRecorder};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::domain::actor::{Actor, Capability};
use crate::domain::quote::{
    NewQuote, NewQuoteItem, Quote, QuoteDetailsPatch, QuoteId, QuoteItemId, QuoteItemPatch,
    QuoteStatus,
};
use crate::errors::{ApplicationError, DomainError};
use crate::lifecycle::TransitionTrigger;
use crate::query::{
    ListParams, PageRequest, PaginatedResponse, QuoteFilters, QuoteQuery, SortDirection,
    SortField, Sorting,
};
use crate::store::{call_store, AuditStore, QuoteCommit, QuoteStore, QuoteWrite};

const QUOTES_MODULE: &str = "quotes";
const QUOTE_ITEMS_MODULE: &str = "quote_items";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSettings {
    pub store_timeout: Duration,
    pub max_conflict_retries: u32,
    pub max_page_size: u32,
    pub audit_batch_size: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl ServiceSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            store_timeout: Duration::from_millis(config.store.timeout_ms),
            max_conflict_retries: config.store.max_conflict_retries,
            max_page_size: config.query.max_page_size,
            audit_batch_size: config.query.audit_batch_size,
        }
    }
}

/// Outcome of an expiry sweep. One failing quote never stops the others.
#[derive(Debug, Default)]
pub struct ExpirySweep {
    pub expired: Vec<QuoteId>,
    pub failed: Vec<(QuoteId, ApplicationError)>,
}

struct Staged<T> {
    write: QuoteWrite,
    entry: AuditEntry,
    value: T,
}

pub struct QuoteService<S, C = SystemClock> {
    store: Arc<S>,
    clock: Arc<C>,
    audit: AuditRecorder<S, C>,
    settings: ServiceSettings,
}

impl<S> QuoteService<S, SystemClock>
where
    S: QuoteStore + AuditStore,
{
    pub fn with_system_clock(store: Arc<S>, settings: ServiceSettings) -> Self {
        Self::new(store, Arc::new(SystemClock), settings)
    }
}

impl<S, C> QuoteService<S, C>
where
    S: QuoteStore + AuditStore,
    C: Clock,
{
    pub fn new(store: Arc<S>, clock: Arc<C>, settings: ServiceSettings) -> Self {
        let audit = AuditRecorder::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            settings.store_timeout,
            settings.audit_batch_size,
        );
        Self { store, clock, audit, settings }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Direct access for callers recording events outside the quote aggregate.
    pub fn audit(&self) -> &AuditRecorder<S, C> {
        &self.audit
    }

    pub async fn create_quote(
        &self,
        actor: &Actor,
        new: NewQuote,
    ) -> Result<Quote, ApplicationError> {
        require(actor, Capability::Write)?;

        let quote = Quote::draft(new, self.clock.now())?;
        let entry = AuditEntry::new(
            AuditAction::Create,
            QUOTES_MODULE,
            format!("Created quote {} for contact {}", quote.id, quote.contact_id),
        )
        .with_metadata("quote_id", quote.id.0.clone())
        .with_metadata("status", quote.status.as_str())
        .with_metadata("item_count", quote.items.len())
        .with_metadata("total_amount", quote.total_amount()?.to_string());

        let audit = self.audit.stamp(actor, entry);
        let commit = QuoteCommit { write: QuoteWrite::Insert(quote.clone()), audit };
        call_store("commit", self.settings.store_timeout, self.store.commit(commit)).await?;

        tracing::info!(
            event_name = "quote.created",
            quote_id = %quote.id,
            actor_id = %actor.actor_id,
            item_count = quote.items.len(),
            "quote created"
        );
        Ok(quote)
    }

    pub async fn get_quote(&self, actor: &Actor, id: &QuoteId) -> Result<Quote, ApplicationError> {
        require(actor, Capability::Read)?;
        self.load(id).await
    }

    pub async fn list(
        &self,
        actor: &Actor,
        params: ListParams,
    ) -> Result<PaginatedResponse<Quote>, ApplicationError> {
        require(actor, Capability::Read)?;
        let query = params.into_query(self.settings.max_page_size)?;
        call_store("list_quotes", self.settings.store_timeout, self.store.list_quotes(&query)).await
    }

    pub async fn add_item(
        &self,
        actor: &Actor,
        id: &QuoteId,
        item: NewQuoteItem,
        expected_version: Option<u32>,
    ) -> Result<(Quote, QuoteItemId), ApplicationError> {
        require(actor, Capability::Write)?;

        self.update_with(actor, id, expected_version, "add_item", |quote, now| {
            let description = item.description.clone();
            let item_id = quote.add_item(item.clone(), now)?;
            let entry = item_entry(
                quote,
                AuditAction::Create,
                &item_id,
                format!("Added item `{description}` to quote {}", quote.id),
            )?;
            Ok((entry, item_id))
        })
        .await
    }

    pub async fn update_item(
        &self,
        actor: &Actor,
        id: &QuoteId,
        item_id: &QuoteItemId,
        patch: QuoteItemPatch,
        expected_version: Option<u32>,
    ) -> Result<Quote, ApplicationError> {
        require(actor, Capability::Write)?;

        let (quote, ()) = self
            .update_with(actor, id, expected_version, "update_item", |quote, now| {
                quote.update_item(item_id, patch.clone(), now)?;
                let entry = item_entry(
                    quote,
                    AuditAction::Update,
                    item_id,
                    format!("Updated item {item_id} on quote {}", quote.id),
                )?;
                Ok((entry, ()))
            })
            .await?;
        Ok(quote)
    }

    pub async fn remove_item(
        &self,
        actor: &Actor,
        id: &QuoteId,
        item_id: &QuoteItemId,
        expected_version: Option<u32>,
    ) -> Result<Quote, ApplicationError> {
        require(actor, Capability::Write)?;

        let (quote, ()) = self
            .update_with(actor, id, expected_version, "remove_item", |quote, now| {
                let removed = quote.remove_item(item_id, now)?;
                let entry = item_entry(
                    quote,
                    AuditAction::Delete,
                    item_id,
                    format!("Removed item `{}` from quote {}", removed.description, quote.id),
                )?;
                Ok((entry, ()))
            })
            .await?;
        Ok(quote)
    }

    pub async fn update_details(
        &self,
        actor: &Actor,
        id: &QuoteId,
        patch: QuoteDetailsPatch,
        expected_version: Option<u32>,
    ) -> Result<Quote, ApplicationError> {
        require(actor, Capability::Write)?;

        let (quote, ()) = self
            .update_with(actor, id, expected_version, "update_details", |quote, now| {
                quote.update_details(patch.clone(), now)?;
                let entry = AuditEntry::new(
                    AuditAction::Update,
                    QUOTES_MODULE,
                    format!("Updated details of quote {}", quote.id),
                )
                .with_metadata("quote_id", quote.id.0.clone())
                .with_metadata("version", quote.version)
                .with_metadata("valid_until", quote.valid_until.to_rfc3339());
                Ok((entry, ()))
            })
            .await?;
        Ok(quote)
    }

    /// Actor-driven status change. Capability failures surface as an
    /// `InvalidQuoteTransition` with an authorization reason.
    pub async fn transition(
        &self,
        actor: &Actor,
        id: &QuoteId,
        next: QuoteStatus,
        expected_version: Option<u32>,
    ) -> Result<Quote, ApplicationError> {
        let (quote, ()) = self
            .update_with(actor, id, expected_version, "transition", |quote, now| {
                let change = quote.transition_to(next, &TransitionTrigger::Actor(actor), now)?;
                Ok((status_entry(quote, change.from, change.to, change.audit_action())?, ()))
            })
            .await?;

        tracing::info!(
            event_name = "quote.status_changed",
            quote_id = %quote.id,
            actor_id = %actor.actor_id,
            status = quote.status.as_str(),
            "quote status changed"
        );
        Ok(quote)
    }

    /// Expires one quote whose validity has elapsed.
    pub async fn expire_quote(&self, id: &QuoteId) -> Result<Quote, ApplicationError> {
        let system = Actor::system();
        let (quote, ()) = self
            .update_with(&system, id, None, "expire", |quote, now| {
                let change =
                    quote.transition_to(QuoteStatus::Expired, &TransitionTrigger::System, now)?;
                Ok((status_entry(quote, change.from, change.to, change.audit_action())?, ()))
            })
            .await?;
        Ok(quote)
    }

    pub async fn expire_overdue(&self) -> Result<ExpirySweep, ApplicationError> {
        let now = self.clock.now();
        let filters = QuoteFilters {
            statuses: [QuoteStatus::Draft, QuoteStatus::Pending].into_iter().collect(),
            valid_until_before: Some(now),
            ..QuoteFilters::default()
        };
        let sorting = Sorting { field: SortField::ValidUntil, direction: SortDirection::Asc };
        let page_size = self.settings.max_page_size;

        // Ids are collected up front: expiring shifts the filtered set under offset paging.
        let mut due = Vec::new();
        let mut page = 1;
        loop {
            let query = QuoteQuery {
                page: PageRequest::new(page, page_size, page_size)?,
                filters: filters.clone(),
                sorting,
            };
            let response = call_store(
                "list_quotes",
                self.settings.store_timeout,
                self.store.list_quotes(&query),
            )
            .await?;
            // Empty drafts cannot expire; they stay drafts until edited or deleted.
            due.extend(
                response
                    .data
                    .into_iter()
                    .filter(|quote| !quote.items.is_empty())
                    .map(|quote| quote.id),
            );
            if !response.has_more {
                break;
            }
            page += 1;
        }

        let mut sweep = ExpirySweep::default();
        for id in due {
            match self.expire_quote(&id).await {
                Ok(_) => sweep.expired.push(id),
                Err(error) => {
                    tracing::warn!(
                        event_name = "quote.expiry_failed",
                        quote_id = %id,
                        error_kind = error.kind().as_str(),
                        error = %error,
                        "quote could not be expired"
                    );
                    sweep.failed.push((id, error));
                }
            }
        }

        tracing::info!(
            event_name = "quote.expiry_sweep_finished",
            expired = sweep.expired.len(),
            failed = sweep.failed.len(),
            "expiry sweep finished"
        );
        Ok(sweep)
    }

    /// Only drafts can be deleted; their items go with them.
    pub async fn delete_quote(
        &self,
        actor: &Actor,
        id: &QuoteId,
        expected_version: Option<u32>,
    ) -> Result<(), ApplicationError> {
        require(actor, Capability::Write)?;

        self.commit_with_retry(actor, id, expected_version, "delete_quote", |quote, _now| {
            if quote.status != QuoteStatus::Draft {
                return Err(DomainError::QuoteLocked { id: quote.id, status: quote.status }.into());
            }
            let entry = AuditEntry::new(
                AuditAction::Delete,
                QUOTES_MODULE,
                format!("Deleted quote {}", quote.id),
            )
            .with_metadata("quote_id", quote.id.0.clone())
            .with_metadata("item_count", quote.items.len());
            Ok(Staged {
                write: QuoteWrite::Delete { id: quote.id, expected_version: quote.version },
                entry,
                value: (),
            })
        })
        .await
    }

    pub fn query_audit(
        &self,
        actor: &Actor,
        filter: AuditFilter,
    ) -> Result<AuditCursor<'_, S>, ApplicationError> {
        require(actor, Capability::Read)?;
        self.audit.query(filter)
    }

    async fn load(&self, id: &QuoteId) -> Result<Quote, ApplicationError> {
        call_store("load_quote", self.settings.store_timeout, self.store.load_quote(id))
            .await?
            .ok_or_else(|| ApplicationError::NotFound(id.clone()))
    }

    async fn update_with<T, F>(
        &self,
        actor: &Actor,
        id: &QuoteId,
        expected_version: Option<u32>,
        operation: &'static str,
        mut apply: F,
    ) -> Result<(Quote, T), ApplicationError>
    where
        T: Send,
        F: FnMut(&mut Quote, DateTime<Utc>) -> Result<(AuditEntry, T), ApplicationError> + Send,
    {
        self.commit_with_retry(actor, id, expected_version, operation, move |mut quote, now| {
            let loaded_version = quote.version;
            let (entry, value) = apply(&mut quote, now)?;
            quote.check_invariants()?;
            Ok(Staged {
                write: QuoteWrite::Update { quote: quote.clone(), expected_version: loaded_version },
                entry,
                value: (quote, value),
            })
        })
        .await
    }

    async fn commit_with_retry<T, F>(
        &self,
        actor: &Actor,
        id: &QuoteId,
        expected_version: Option<u32>,
        operation: &'static str,
        mut stage: F,
    ) -> Result<T, ApplicationError>
    where
        T: Send,
        F: FnMut(Quote, DateTime<Utc>) -> Result<Staged<T>, ApplicationError> + Send,
    {
        let correlation_id = Uuid::new_v4().to_string();
        let mut conflicts = 0u32;

        loop {
            let current = self.load(id).await?;
            if let Some(expected) = expected_version {
                if current.version != expected {
                    return Err(ApplicationError::ConcurrentModification {
                        id: id.clone(),
                        expected,
                        actual: current.version,
                    });
                }
            }

            let Staged { write, entry, value } = stage(current, self.clock.now())?;
            let audit = self.audit.stamp(actor, entry);
            let audit_id = audit.id.clone();
            let commit = QuoteCommit { write, audit };

            match call_store("commit", self.settings.store_timeout, self.store.commit(commit)).await
            {
                Ok(()) => {
                    tracing::info!(
                        event_name = "quote.committed",
                        operation,
                        quote_id = %id,
                        actor_id = %actor.actor_id,
                        audit_id = %audit_id,
                        correlation_id = %correlation_id,
                        "quote change committed"
                    );
                    return Ok(value);
                }
                Err(ApplicationError::ConcurrentModification { actual, .. })
                    if expected_version.is_none()
                        && conflicts < self.settings.max_conflict_retries =>
                {
                    conflicts += 1;
                    tracing::warn!(
                        event_name = "quote.commit_conflict",
                        operation,
                        quote_id = %id,
                        stored_version = actual,
                        attempt = conflicts,
                        correlation_id = %correlation_id,
                        "version conflict, reloading quote"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        event_name = "quote.commit_failed",
                        operation,
                        quote_id = %id,
                        actor_id = %actor.actor_id,
                        error_kind = error.kind().as_str(),
                        error = %error,
                        correlation_id = %correlation_id,
                        "quote change was not committed"
                    );
                    return Err(error);
                }
            }
        }
    }
}

fn require(actor: &Actor, capability: Capability) -> Result<(), ApplicationError> {
    if actor.has(capability) {
        return Ok(());
    }
    Err(ApplicationError::Unauthorized { actor_id: actor.actor_id.clone(), capability })
}

fn item_entry(
    quote: &Quote,
    action: AuditAction,
    item_id: &QuoteItemId,
    details: String,
) -> Result<AuditEntry, ApplicationError> {
    Ok(AuditEntry::new(action, QUOTE_ITEMS_MODULE, details)
        .with_metadata("quote_id", quote.id.0.clone())
        .with_metadata("item_id", item_id.0.clone())
        .with_metadata("version", quote.version)
        .with_metadata("total_amount", quote.total_amount()?.to_string()))
}

fn status_entry(
    quote: &Quote,
    from: QuoteStatus,
    to: QuoteStatus,
    action: AuditAction,
) -> Result<AuditEntry, ApplicationError> {
    Ok(AuditEntry::new(action, QUOTES_MODULE, format!("Quote {} moved from {from} to {to}", quote.id))
        .with_metadata("quote_id", quote.id.0.clone())
        .with_metadata("from", from.as_str())
        .with_metadata("to", to.as_str())
        .with_metadata("version", quote.version)
        .with_metadata("total_amount", quote.total_amount()?.to_string()))
}
