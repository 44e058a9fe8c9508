use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;

use quotedesk_core::audit::{AuditFilter, AuditLog, AuditPosition};
use quotedesk_core::domain::quote::{Quote, QuoteId};
use quotedesk_core::query::{PaginatedResponse, QuoteQuery};
use quotedesk_core::store::{AuditStore, QuoteCommit, QuoteStore, QuoteWrite, StoreError};

#[derive(Default)]
struct State {
    quotes: HashMap<String, Quote>,
    audit: Vec<AuditLog>,
}

/// Store backed by process memory. A commit holds the write lock from the
/// version check until the audit append, so it is all-or-nothing.
#[derive(Default)]
pub struct InMemoryQuoteStore {
    state: RwLock<State>,
    fail_audit_writes: AtomicBool,
    latency: Option<Duration>,
}

impl InMemoryQuoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call, for exercising store timeouts and interleavings.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// When set, audit appends fail and so do the commits carrying them.
    pub fn fail_audit_writes(&self, fail: bool) {
        self.fail_audit_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn audit_len(&self) -> usize {
        self.state.read().await.audit.len()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_audit_writable(&self) -> Result<(), StoreError> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            return Err(StoreError::AuditAppend("audit log is not writable".to_string()));
        }
        Ok(())
    }
}

fn check_version(
    quotes: &HashMap<String, Quote>,
    id: &QuoteId,
    expected: u32,
) -> Result<(), StoreError> {
    let stored = quotes.get(&id.0).ok_or_else(|| StoreError::NotFound(id.clone()))?;
    if stored.version != expected {
        return Err(StoreError::VersionConflict {
            id: id.clone(),
            expected,
            actual: stored.version,
        });
    }
    Ok(())
}

#[async_trait::async_trait]
impl QuoteStore for InMemoryQuoteStore {
    async fn load_quote(&self, id: &QuoteId) -> Result<Option<Quote>, StoreError> {
        self.simulate_latency().await;
        let state = self.state.read().await;
        Ok(state.quotes.get(&id.0).cloned())
    }

    async fn commit(&self, commit: QuoteCommit) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;

        match &commit.write {
            QuoteWrite::Insert(quote) => {
                if state.quotes.contains_key(&quote.id.0) {
                    return Err(StoreError::AlreadyExists(quote.id.clone()));
                }
            }
            QuoteWrite::Update { quote, expected_version } => {
                check_version(&state.quotes, &quote.id, *expected_version)?;
            }
            QuoteWrite::Delete { id, expected_version } => {
                check_version(&state.quotes, id, *expected_version)?;
            }
        }
        self.check_audit_writable()?;

        match commit.write {
            QuoteWrite::Insert(quote) | QuoteWrite::Update { quote, .. } => {
                state.quotes.insert(quote.id.0.clone(), quote);
            }
            QuoteWrite::Delete { id, .. } => {
                state.quotes.remove(&id.0);
            }
        }
        state.audit.push(commit.audit);
        Ok(())
    }

    async fn list_quotes(&self, query: &QuoteQuery) -> Result<PaginatedResponse<Quote>, StoreError> {
        self.simulate_latency().await;
        let state = self.state.read().await;

        let mut matching: Vec<Quote> =
            state.quotes.values().filter(|quote| query.filters.matches(quote)).cloned().collect();
        matching.sort_by(|a, b| query.sorting.compare(a, b));

        Ok(PaginatedResponse::from_sorted(matching, query.page))
    }
}

#[async_trait::async_trait]
impl AuditStore for InMemoryQuoteStore {
    async fn append_audit(&self, log: AuditLog) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.check_audit_writable()?;
        self.state.write().await.audit.push(log);
        Ok(())
    }

    async fn scan_audit(
        &self,
        filter: &AuditFilter,
        after: Option<&AuditPosition>,
        limit: u32,
    ) -> Result<Vec<AuditLog>, StoreError> {
        self.simulate_latency().await;
        let state = self.state.read().await;

        let mut matching: Vec<&AuditLog> = state
            .audit
            .iter()
            .filter(|log| filter.matches(log))
            .filter(|log| after.map_or(true, |position| position.precedes(log)))
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));

        Ok(matching.into_iter().take(limit as usize).cloned().collect())
    }
}
