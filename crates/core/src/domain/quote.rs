use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;
use crate::lifecycle::{self, StatusChange, TransitionTrigger};
use crate::pricing;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuoteId(pub String);

impl QuoteId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for QuoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuoteItemId(pub String);

impl QuoteItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for QuoteItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declaration order is lifecycle order, so the derived `Ord` sorts by lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteStatus {
    Draft,
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl QuoteStatus {
    pub const ALL: [QuoteStatus; 5] =
        [Self::Draft, Self::Pending, Self::Accepted, Self::Rejected, Self::Expired];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Some(Self::Draft),
            "PENDING" => Some(Self::Pending),
            "ACCEPTED" => Some(Self::Accepted),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Expired)
    }

    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Draft | Self::Pending)
    }
}

impl fmt::Display for QuoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteItem {
    pub id: QuoteItemId,
    pub quote_id: QuoteId,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub service_id: Option<String>,
}

impl QuoteItem {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.description.trim().is_empty() {
            return Err(DomainError::validation("description", "must not be blank"));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(DomainError::validation("quantity", "must be greater than zero"));
        }
        if self.unit_price < Decimal::ZERO {
            return Err(DomainError::validation("unit_price", "must not be negative"));
        }
        if !is_fraction(self.discount) {
            return Err(DomainError::validation("discount", "must be within [0, 1]"));
        }
        if !is_fraction(self.tax) {
            return Err(DomainError::validation("tax", "must be within [0, 1]"));
        }
        Ok(())
    }
}

fn is_fraction(value: Decimal) -> bool {
    value >= Decimal::ZERO && value <= Decimal::ONE
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQuoteItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    #[serde(default)]
    pub discount: Option<Decimal>,
    #[serde(default)]
    pub tax: Option<Decimal>,
    #[serde(default)]
    pub service_id: Option<String>,
}

impl NewQuoteItem {
    pub fn into_item(self, quote_id: &QuoteId) -> Result<QuoteItem, DomainError> {
        let item = QuoteItem {
            id: QuoteItemId::generate(),
            quote_id: quote_id.clone(),
            description: self.description,
            quantity: self.quantity,
            unit_price: self.unit_price,
            discount: self.discount.unwrap_or(Decimal::ZERO),
            tax: self.tax.unwrap_or(Decimal::ZERO),
            service_id: self.service_id,
        };
        item.validate()?;
        Ok(item)
    }
}

/// Field-wise change to an item; `None` leaves the field as is.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteItemPatch {
    pub description: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub discount: Option<Decimal>,
    pub tax: Option<Decimal>,
    pub service_id: Option<Option<String>>,
}

impl QuoteItemPatch {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.quantity.is_none()
            && self.unit_price.is_none()
            && self.discount.is_none()
            && self.tax.is_none()
            && self.service_id.is_none()
    }

    fn apply_to(self, item: &mut QuoteItem) {
        if let Some(description) = self.description {
            item.description = description;
        }
        if let Some(quantity) = self.quantity {
            item.quantity = quantity;
        }
        if let Some(unit_price) = self.unit_price {
            item.unit_price = unit_price;
        }
        if let Some(discount) = self.discount {
            item.discount = discount;
        }
        if let Some(tax) = self.tax {
            item.tax = tax;
        }
        if let Some(service_id) = self.service_id {
            item.service_id = service_id;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQuote {
    pub contact_id: String,
    pub freelancer_id: String,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub items: Vec<NewQuoteItem>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteDetailsPatch {
    pub notes: Option<Option<String>>,
    pub folder: Option<Option<String>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl QuoteDetailsPatch {
    pub fn is_empty(&self) -> bool {
        self.notes.is_none() && self.folder.is_none() && self.valid_until.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub id: QuoteId,
    pub contact_id: String,
    pub freelancer_id: String,
    pub status: QuoteStatus,
    pub valid_until: DateTime<Utc>,
    pub notes: Option<String>,
    pub folder: Option<String>,
    pub items: Vec<QuoteItem>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    pub fn draft(new: NewQuote, now: DateTime<Utc>) -> Result<Self, DomainError> {
        if new.contact_id.trim().is_empty() {
            return Err(DomainError::validation("contact_id", "must not be blank"));
        }
        if new.freelancer_id.trim().is_empty() {
            return Err(DomainError::validation("freelancer_id", "must not be blank"));
        }
        if new.valid_until <= now {
            return Err(DomainError::validation("valid_until", "must be in the future"));
        }

        let id = QuoteId::generate();
        let items = new
            .items
            .into_iter()
            .map(|item| item.into_item(&id))
            .collect::<Result<Vec<_>, _>>()?;

        let quote = Self {
            id,
            contact_id: new.contact_id,
            freelancer_id: new.freelancer_id,
            status: QuoteStatus::Draft,
            valid_until: new.valid_until,
            notes: new.notes,
            folder: new.folder,
            items,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        quote.total_amount()?;
        Ok(quote)
    }

    /// Derived from the items on every call; never cached.
    pub fn total_amount(&self) -> Result<Decimal, DomainError> {
        pricing::compute_quote_total(&self.items)
    }

    pub fn ensure_editable(&self) -> Result<(), DomainError> {
        if self.status.is_editable() {
            return Ok(());
        }
        Err(DomainError::QuoteLocked { id: self.id.clone(), status: self.status })
    }

    pub fn add_item(
        &mut self,
        new: NewQuoteItem,
        now: DateTime<Utc>,
    ) -> Result<QuoteItemId, DomainError> {
        self.ensure_editable()?;
        let item = new.into_item(&self.id)?;
        let item_id = item.id.clone();

        let mut items = self.items.clone();
        items.push(item);
        pricing::compute_quote_total(&items)?;

        self.items = items;
        self.touch(now);
        Ok(item_id)
    }

    pub fn update_item(
        &mut self,
        item_id: &QuoteItemId,
        patch: QuoteItemPatch,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_editable()?;
        if patch.is_empty() {
            return Err(DomainError::validation("patch", "at least one field must change"));
        }
        let position = self.position_of(item_id)?;

        let mut items = self.items.clone();
        patch.apply_to(&mut items[position]);
        items[position].validate()?;
        pricing::compute_quote_total(&items)?;

        self.items = items;
        self.touch(now);
        Ok(())
    }

    pub fn remove_item(
        &mut self,
        item_id: &QuoteItemId,
        now: DateTime<Utc>,
    ) -> Result<QuoteItem, DomainError> {
        self.ensure_editable()?;
        let position = self.position_of(item_id)?;
        if self.items.len() == 1 && self.status != QuoteStatus::Draft {
            return Err(DomainError::validation(
                "items",
                format!("quote in status {} must keep at least one item", self.status),
            ));
        }

        let removed = self.items.remove(position);
        self.touch(now);
        Ok(removed)
    }

    pub fn update_details(
        &mut self,
        patch: QuoteDetailsPatch,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_editable()?;
        if patch.is_empty() {
            return Err(DomainError::validation("patch", "at least one field must change"));
        }
        if let Some(valid_until) = patch.valid_until {
            if valid_until <= now {
                return Err(DomainError::validation("valid_until", "must be in the future"));
            }
        }

        if let Some(notes) = patch.notes {
            self.notes = notes;
        }
        if let Some(folder) = patch.folder {
            self.folder = folder;
        }
        if let Some(valid_until) = patch.valid_until {
            self.valid_until = valid_until;
        }
        self.touch(now);
        Ok(())
    }

    pub fn can_transition_to(&self, next: QuoteStatus) -> bool {
        matches!(
            (self.status, next),
            (QuoteStatus::Draft, QuoteStatus::Pending)
                | (QuoteStatus::Pending, QuoteStatus::Accepted)
                | (QuoteStatus::Pending, QuoteStatus::Rejected)
                | (QuoteStatus::Draft, QuoteStatus::Expired)
                | (QuoteStatus::Pending, QuoteStatus::Expired)
        )
    }

    pub fn transition_to(
        &mut self,
        next: QuoteStatus,
        trigger: &TransitionTrigger<'_>,
        now: DateTime<Utc>,
    ) -> Result<StatusChange, DomainError> {
        lifecycle::check_transition(self, next, trigger, now)?;

        let change = StatusChange { from: self.status, to: next, at: now };
        self.status = next;
        self.touch(now);
        Ok(change)
    }

    /// Invariants every persisted quote must satisfy.
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if self.items.is_empty() && self.status != QuoteStatus::Draft {
            return Err(DomainError::validation(
                "items",
                format!("quote in status {} must keep at least one item", self.status),
            ));
        }
        if self.items.iter().any(|item| item.quote_id != self.id) {
            return Err(DomainError::validation("items", "item belongs to another quote"));
        }
        self.total_amount().map(|_| ())
    }

    fn position_of(&self, item_id: &QuoteItemId) -> Result<usize, DomainError> {
        self.items
            .iter()
            .position(|item| &item.id == item_id)
            .ok_or_else(|| DomainError::validation("item_id", format!("unknown item {item_id}")))
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now.max(self.updated_at);
    }
}
