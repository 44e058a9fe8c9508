use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::actor::Actor;
use crate::errors::{ApplicationError, DomainError};
use crate::store::{call_store, AuditStore};

pub type AuditMetadata = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuditLogId(pub String);

impl fmt::Display for AuditLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Read,
    Update,
    Delete,
    Login,
    Logout,
    Error,
    Approve,
    Reject,
    Expire,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Error => "error",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Expire => "expire",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "create" => Some(Self::Create),
            "read" => Some(Self::Read),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "login" => Some(Self::Login),
            "logout" => Some(Self::Logout),
            "error" => Some(Self::Error),
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "expire" => Some(Self::Expire),
            _ => None,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit record. Never updated or deleted once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: AuditLogId,
    pub timestamp: DateTime<Utc>,
    pub actor_id: Option<String>,
    pub actor_role: Option<String>,
    pub action: AuditAction,
    pub module: String,
    pub details: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Option<AuditMetadata>,
}

impl AuditLog {
    pub fn position(&self) -> AuditPosition {
        AuditPosition { timestamp: self.timestamp, id: self.id.clone() }
    }
}

/// What a caller wants recorded; the recorder adds identity, id and timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub module: String,
    pub details: String,
    pub metadata: Option<AuditMetadata>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, module: impl Into<String>, details: impl Into<String>) -> Self {
        Self { action, module: module.into(), details: details.into(), metadata: None }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.get_or_insert_with(BTreeMap::new).insert(key.into(), value.into());
        self
    }
}

/// Keyset position in the `(timestamp desc, id desc)` audit ordering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditPosition {
    pub timestamp: DateTime<Utc>,
    pub id: AuditLogId,
}

impl AuditPosition {
    /// True when `log` sorts strictly after this position in descending order.
    pub fn precedes(&self, log: &AuditLog) -> bool {
        log.timestamp < self.timestamp || (log.timestamp == self.timestamp && log.id < self.id)
    }
}

/// Inclusive on both ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub date_range: Option<DateRange>,
    pub module: Option<String>,
    pub action: Option<AuditAction>,
    pub search_term: Option<String>,
}

impl AuditFilter {
    pub fn validate(&self) -> Result<(), DomainError> {
        if let Some(range) = &self.date_range {
            if range.start > range.end {
                return Err(DomainError::validation("date_range", "start must not be after end"));
            }
        }
        Ok(())
    }

    /// Search term with surrounding blanks removed; blank terms match everything.
    pub fn normalized_search(&self) -> Option<String> {
        self.search_term
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, log: &AuditLog) -> bool {
        if let Some(range) = &self.date_range {
            if !range.contains(log.timestamp) {
                return false;
            }
        }
        if let Some(module) = &self.module {
            if &log.module != module {
                return false;
            }
        }
        if let Some(action) = self.action {
            if log.action != action {
                return false;
            }
        }
        match self.normalized_search() {
            Some(term) => log.details.to_lowercase().contains(&term),
            None => true,
        }
    }
}

/// Stamps and appends audit records.
///
/// Timestamps are truncated to microseconds and kept strictly increasing, so
/// replaying the same call yields distinct records.
pub struct AuditRecorder<A: ?Sized, C: ?Sized> {
    store: Arc<A>,
    clock: Arc<C>,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
    timeout: Duration,
    batch_size: u32,
}

impl<A, C> AuditRecorder<A, C>
where
    A: AuditStore + ?Sized,
    C: Clock + ?Sized,
{
    pub fn new(store: Arc<A>, clock: Arc<C>, timeout: Duration, batch_size: u32) -> Self {
        Self { store, clock, last_stamp: Mutex::new(None), timeout, batch_size: batch_size.max(1) }
    }

    pub fn stamp(&self, actor: &Actor, entry: AuditEntry) -> AuditLog {
        AuditLog {
            id: AuditLogId(Uuid::new_v4().to_string()),
            timestamp: self.next_timestamp(),
            actor_id: Some(actor.actor_id.clone()),
            actor_role: Some(actor.role.clone()),
            action: entry.action,
            module: entry.module,
            details: entry.details,
            ip_address: actor.ip_address.clone(),
            user_agent: actor.user_agent.clone(),
            metadata: entry.metadata,
        }
    }

    pub async fn record(
        &self,
        actor: &Actor,
        action: AuditAction,
        module: impl Into<String>,
        details: impl Into<String>,
        metadata: Option<AuditMetadata>,
    ) -> Result<AuditLog, ApplicationError> {
        let mut entry = AuditEntry::new(action, module, details);
        entry.metadata = metadata;
        let log = self.stamp(actor, entry);

        match call_store("append_audit", self.timeout, self.store.append_audit(log.clone())).await
        {
            Ok(()) => {
                tracing::debug!(
                    event_name = "audit.recorded",
                    audit_id = %log.id,
                    action = log.action.as_str(),
                    module = %log.module,
                    actor_id = %actor.actor_id,
                    "audit record appended"
                );
                Ok(log)
            }
            Err(ApplicationError::StoreUnavailable(message)) => {
                tracing::error!(
                    event_name = "audit.write_failed",
                    action = log.action.as_str(),
                    module = %log.module,
                    actor_id = %actor.actor_id,
                    error = %message,
                    "audit record could not be appended"
                );
                Err(ApplicationError::AuditWrite(message))
            }
            Err(error) => Err(error),
        }
    }

    /// Lazily walks matching records, newest first.
    pub fn query(&self, filter: AuditFilter) -> Result<AuditCursor<'_, A>, ApplicationError> {
        filter.validate()?;
        Ok(AuditCursor {
            store: self.store.as_ref(),
            filter,
            batch_size: self.batch_size,
            timeout: self.timeout,
            buffer: VecDeque::new(),
            after: None,
            exhausted: false,
        })
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = self.clock.now().trunc_subsecs(6);
        let mut last = match self.last_stamp.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stamp = match *last {
            Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

/// Pull-based sequence over audit records. Each refill fetches one batch.
pub struct AuditCursor<'a, A: ?Sized> {
    store: &'a A,
    filter: AuditFilter,
    batch_size: u32,
    timeout: Duration,
    buffer: VecDeque<AuditLog>,
    after: Option<AuditPosition>,
    exhausted: bool,
}

impl<'a, A> AuditCursor<'a, A>
where
    A: AuditStore + ?Sized,
{
    pub async fn next(&mut self) -> Result<Option<AuditLog>, ApplicationError> {
        if self.buffer.is_empty() && !self.exhausted {
            let batch = call_store(
                "scan_audit",
                self.timeout,
                self.store.scan_audit(&self.filter, self.after.as_ref(), self.batch_size),
            )
            .await?;

            if (batch.len() as u64) < u64::from(self.batch_size) {
                self.exhausted = true;
            }
            if let Some(last) = batch.last() {
                self.after = Some(last.position());
            }
            self.buffer.extend(batch);
        }

        Ok(self.buffer.pop_front())
    }

    pub async fn collect_all(mut self) -> Result<Vec<AuditLog>, ApplicationError> {
        let mut logs = Vec::new();
        while let Some(log) = self.next().await? {
            logs.push(log);
        }
        Ok(logs)
    }
}
