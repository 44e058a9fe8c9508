use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::quote::{Quote, QuoteStatus};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total_count: u64,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total_count: u64, page: PageRequest) -> Self {
        let seen = u64::from(page.page) * u64::from(page.page_size);
        Self {
            data,
            total_count,
            page: page.page,
            page_size: page.page_size,
            has_more: seen < total_count,
        }
    }

    /// Slice an already filtered and sorted collection.
    pub fn from_sorted(items: Vec<T>, page: PageRequest) -> Self {
        let total_count = items.len() as u64;
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let data = items.into_iter().skip(offset).take(page.page_size as usize).collect();
        Self::new(data, total_count, page)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32, max_page_size: u32) -> Result<Self, DomainError> {
        if page == 0 {
            return Err(DomainError::validation("page", "must be at least 1"));
        }
        if page_size == 0 {
            return Err(DomainError::validation("page_size", "must be at least 1"));
        }
        if page_size > max_page_size {
            return Err(DomainError::validation(
                "page_size",
                format!("must not exceed {max_page_size}"),
            ));
        }
        Ok(Self { page, page_size })
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    UpdatedAt,
    CreatedAt,
    ValidUntil,
    Status,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdatedAt => "updated_at",
            Self::CreatedAt => "created_at",
            Self::ValidUntil => "valid_until",
            Self::Status => "status",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "updated_at" | "updatedat" => Some(Self::UpdatedAt),
            "created_at" | "createdat" => Some(Self::CreatedAt),
            "valid_until" | "validuntil" => Some(Self::ValidUntil),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sorting {
    pub field: SortField,
    pub direction: SortDirection,
}

impl Default for Sorting {
    fn default() -> Self {
        Self { field: SortField::UpdatedAt, direction: SortDirection::Desc }
    }
}

impl Sorting {
    /// Ties fall back to ascending id so pages never overlap.
    pub fn compare(&self, a: &Quote, b: &Quote) -> Ordering {
        let primary = match self.field {
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::ValidUntil => a.valid_until.cmp(&b.valid_until),
            SortField::Status => a.status.cmp(&b.status),
        };
        let primary = match self.direction {
            SortDirection::Asc => primary,
            SortDirection::Desc => primary.reverse(),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

/// Recognized list filters. Unknown keys are kept in `extra` and never
/// influence the result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteFilters {
    pub statuses: BTreeSet<QuoteStatus>,
    pub contact_id: Option<String>,
    pub freelancer_id: Option<String>,
    pub folder: Option<String>,
    pub search: Option<String>,
    pub valid_until_before: Option<DateTime<Utc>>,
    pub extra: BTreeMap<String, String>,
}

impl QuoteFilters {
    pub const STATUS: &'static str = "status";
    pub const CONTACT_ID: &'static str = "contact_id";
    pub const FREELANCER_ID: &'static str = "freelancer_id";
    pub const FOLDER: &'static str = "folder";
    pub const SEARCH: &'static str = "search";
    pub const VALID_UNTIL_BEFORE: &'static str = "valid_until_before";

    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self, DomainError> {
        let mut filters = Self::default();

        for (key, value) in params {
            let trimmed = value.trim();
            match key.as_str() {
                Self::STATUS => {
                    for part in trimmed.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                        let status = QuoteStatus::parse(part).ok_or_else(|| {
                            DomainError::validation(Self::STATUS, format!("unknown status `{part}`"))
                        })?;
                        filters.statuses.insert(status);
                    }
                }
                Self::CONTACT_ID => filters.contact_id = non_blank(trimmed),
                Self::FREELANCER_ID => filters.freelancer_id = non_blank(trimmed),
                Self::FOLDER => filters.folder = non_blank(trimmed),
                Self::SEARCH => filters.search = non_blank(trimmed),
                Self::VALID_UNTIL_BEFORE => {
                    let at = DateTime::parse_from_rfc3339(trimmed)
                        .map_err(|error| {
                            DomainError::validation(Self::VALID_UNTIL_BEFORE, error.to_string())
                        })?
                        .with_timezone(&Utc);
                    filters.valid_until_before = Some(at);
                }
                _ => {
                    filters.extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(filters)
    }

    pub fn normalized_search(&self) -> Option<String> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_lowercase)
    }

    pub fn matches(&self, quote: &Quote) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&quote.status) {
            return false;
        }
        if let Some(contact_id) = &self.contact_id {
            if &quote.contact_id != contact_id {
                return false;
            }
        }
        if let Some(freelancer_id) = &self.freelancer_id {
            if &quote.freelancer_id != freelancer_id {
                return false;
            }
        }
        if let Some(folder) = &self.folder {
            if quote.folder.as_ref() != Some(folder) {
                return false;
            }
        }
        if let Some(before) = self.valid_until_before {
            if quote.valid_until > before {
                return false;
            }
        }
        match self.normalized_search() {
            Some(term) => {
                quote.id.0.to_lowercase().contains(&term)
                    || quote.notes.as_deref().is_some_and(|notes| notes.to_lowercase().contains(&term))
            }
            None => true,
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListParams {
    pub page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub filters: QuoteFilters,
    #[serde(default)]
    pub sorting: Option<Sorting>,
}

impl ListParams {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size, filters: QuoteFilters::default(), sorting: None }
    }

    pub fn into_query(self, max_page_size: u32) -> Result<QuoteQuery, DomainError> {
        Ok(QuoteQuery {
            page: PageRequest::new(self.page, self.page_size, max_page_size)?,
            filters: self.filters,
            sorting: self.sorting.unwrap_or_default(),
        })
    }
}

/// Validated list request handed to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuoteQuery {
    pub page: PageRequest,
    pub filters: QuoteFilters,
    pub sorting: Sorting,
}
