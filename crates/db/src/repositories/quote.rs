use std::collections::HashMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use quotedesk_core::domain::quote::{Quote, QuoteId, QuoteItem, QuoteItemId, QuoteStatus};
use quotedesk_core::query::{PaginatedResponse, QuoteFilters, QuoteQuery, SortDirection, SortField};
use quotedesk_core::store::{QuoteCommit, QuoteStore, QuoteWrite, StoreError};

use super::audit::insert_audit;
use super::{format_timestamp, parse_decimal, parse_timestamp, parse_u32, RepositoryError};
use crate::DbPool;

const QUOTE_COLUMNS: &str = "id, contact_id, freelancer_id, status, valid_until, notes, folder, \
                             version, created_at, updated_at";

/// SQLite-backed store. Each commit runs in one transaction; a commit future
/// dropped before completion rolls the transaction back.
#[derive(Clone)]
pub struct SqlQuoteStore {
    pub(crate) pool: DbPool,
}

impl SqlQuoteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load(&self, id: &QuoteId) -> Result<Option<Quote>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!("SELECT {QUOTE_COLUMNS} FROM quote WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut quote = quote_from_row(row)?;
        let mut items = load_items(&mut tx, &[quote.id.clone()]).await?;
        quote.items = items.remove(&quote.id.0).unwrap_or_default();
        tx.commit().await?;
        Ok(Some(quote))
    }

    async fn apply(&self, commit: QuoteCommit) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        match &commit.write {
            QuoteWrite::Insert(quote) => {
                let inserted = sqlx::query(
                    "INSERT INTO quote (
                        id, contact_id, freelancer_id, status, valid_until, notes, notes_folded,
                        folder, version, created_at, updated_at
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO NOTHING",
                )
                .bind(&quote.id.0)
                .bind(&quote.contact_id)
                .bind(&quote.freelancer_id)
                .bind(quote.status.as_str())
                .bind(format_timestamp(&quote.valid_until))
                .bind(quote.notes.as_deref())
                .bind(folded_notes(quote))
                .bind(quote.folder.as_deref())
                .bind(i64::from(quote.version))
                .bind(format_timestamp(&quote.created_at))
                .bind(format_timestamp(&quote.updated_at))
                .execute(&mut *tx)
                .await?;
                if inserted.rows_affected() == 0 {
                    return Err(StoreError::AlreadyExists(quote.id.clone()).into());
                }
                insert_items(&mut tx, quote).await?;
            }
            QuoteWrite::Update { quote, expected_version } => {
                let updated = sqlx::query(
                    "UPDATE quote SET
                        contact_id = ?,
                        freelancer_id = ?,
                        status = ?,
                        valid_until = ?,
                        notes = ?,
                        notes_folded = ?,
                        folder = ?,
                        version = ?,
                        updated_at = ?
                     WHERE id = ? AND version = ?",
                )
                .bind(&quote.contact_id)
                .bind(&quote.freelancer_id)
                .bind(quote.status.as_str())
                .bind(format_timestamp(&quote.valid_until))
                .bind(quote.notes.as_deref())
                .bind(folded_notes(quote))
                .bind(quote.folder.as_deref())
                .bind(i64::from(quote.version))
                .bind(format_timestamp(&quote.updated_at))
                .bind(&quote.id.0)
                .bind(i64::from(*expected_version))
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(missing_or_conflict(&mut tx, &quote.id, *expected_version).await);
                }

                sqlx::query("DELETE FROM quote_item WHERE quote_id = ?")
                    .bind(&quote.id.0)
                    .execute(&mut *tx)
                    .await?;
                insert_items(&mut tx, quote).await?;
            }
            QuoteWrite::Delete { id, expected_version } => {
                let deleted = sqlx::query("DELETE FROM quote WHERE id = ? AND version = ?")
                    .bind(&id.0)
                    .bind(i64::from(*expected_version))
                    .execute(&mut *tx)
                    .await?;
                if deleted.rows_affected() == 0 {
                    return Err(missing_or_conflict(&mut tx, id, *expected_version).await);
                }
            }
        }

        insert_audit(&mut tx, &commit.audit)
            .await
            .map_err(|error| StoreError::AuditAppend(error.to_string()))?;
        tx.commit().await?;
        Ok(())
    }

    async fn page(&self, query: &QuoteQuery) -> Result<PaginatedResponse<Quote>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS count FROM quote WHERE 1=1");
        push_filters(&mut count, &query.filters);
        let total_count = count.build().fetch_one(&mut *tx).await?.try_get::<i64, _>("count")?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {QUOTE_COLUMNS} FROM quote WHERE 1=1"));
        push_filters(&mut select, &query.filters);
        select.push(" ORDER BY ");
        select.push(match query.sorting.field {
            SortField::UpdatedAt => "updated_at",
            SortField::CreatedAt => "created_at",
            SortField::ValidUntil => "valid_until",
            SortField::Status => {
                "CASE status WHEN 'DRAFT' THEN 0 WHEN 'PENDING' THEN 1 WHEN 'ACCEPTED' THEN 2 \
                 WHEN 'REJECTED' THEN 3 ELSE 4 END"
            }
        });
        select.push(match query.sorting.direction {
            SortDirection::Asc => " ASC",
            SortDirection::Desc => " DESC",
        });
        select.push(", id ASC LIMIT ");
        select.push_bind(i64::from(query.page.page_size));
        select.push(" OFFSET ");
        select.push_bind(i64::try_from(query.page.offset()).unwrap_or(i64::MAX));

        let rows = select.build().fetch_all(&mut *tx).await?;
        let mut quotes = rows.into_iter().map(quote_from_row).collect::<Result<Vec<_>, _>>()?;

        let ids: Vec<QuoteId> = quotes.iter().map(|quote| quote.id.clone()).collect();
        let mut items = load_items(&mut tx, &ids).await?;
        for quote in &mut quotes {
            quote.items = items.remove(&quote.id.0).unwrap_or_default();
        }
        tx.commit().await?;

        let total_count = u64::try_from(total_count)
            .map_err(|_| RepositoryError::Decode(format!("negative row count {total_count}")))?;
        Ok(PaginatedResponse::new(quotes, total_count, query.page))
    }
}

#[async_trait::async_trait]
impl QuoteStore for SqlQuoteStore {
    async fn load_quote(&self, id: &QuoteId) -> Result<Option<Quote>, StoreError> {
        self.load(id).await.map_err(StoreError::from)
    }

    async fn commit(&self, commit: QuoteCommit) -> Result<(), StoreError> {
        self.apply(commit).await.map_err(StoreError::from)
    }

    async fn list_quotes(&self, query: &QuoteQuery) -> Result<PaginatedResponse<Quote>, StoreError> {
        self.page(query).await.map_err(StoreError::from)
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filters: &QuoteFilters) {
    if !filters.statuses.is_empty() {
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in &filters.statuses {
            separated.push_bind(status.as_str());
        }
        builder.push(")");
    }
    if let Some(contact_id) = &filters.contact_id {
        builder.push(" AND contact_id = ");
        builder.push_bind(contact_id.clone());
    }
    if let Some(freelancer_id) = &filters.freelancer_id {
        builder.push(" AND freelancer_id = ");
        builder.push_bind(freelancer_id.clone());
    }
    if let Some(folder) = &filters.folder {
        builder.push(" AND folder = ");
        builder.push_bind(folder.clone());
    }
    if let Some(before) = &filters.valid_until_before {
        builder.push(" AND valid_until <= ");
        builder.push_bind(format_timestamp(before));
    }
    if let Some(term) = filters.normalized_search() {
        builder.push(" AND (instr(LOWER(id), ");
        builder.push_bind(term.clone());
        builder.push(") > 0 OR instr(notes_folded, ");
        builder.push_bind(term);
        builder.push(") > 0)");
    }
}

/// Notes folded the same way `QuoteFilters::normalized_search` folds terms.
fn folded_notes(quote: &Quote) -> String {
    quote.notes.as_deref().map(str::to_lowercase).unwrap_or_default()
}

async fn missing_or_conflict(
    conn: &mut SqliteConnection,
    id: &QuoteId,
    expected: u32,
) -> RepositoryError {
    let stored = sqlx::query("SELECT version FROM quote WHERE id = ?")
        .bind(&id.0)
        .fetch_optional(&mut *conn)
        .await;

    match stored {
        Ok(None) => StoreError::NotFound(id.clone()).into(),
        Ok(Some(row)) => match row.try_get::<i64, _>("version") {
            Ok(actual) => match parse_u32("version", actual) {
                Ok(actual) => {
                    StoreError::VersionConflict { id: id.clone(), expected, actual }.into()
                }
                Err(error) => error,
            },
            Err(error) => error.into(),
        },
        Err(error) => error.into(),
    }
}

async fn insert_items(conn: &mut SqliteConnection, quote: &Quote) -> Result<(), RepositoryError> {
    for (position, item) in quote.items.iter().enumerate() {
        sqlx::query(
            "INSERT INTO quote_item (
                id, quote_id, position, description, quantity, unit_price, discount, tax, service_id
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id.0)
        .bind(&quote.id.0)
        .bind(i64::try_from(position).unwrap_or(i64::MAX))
        .bind(&item.description)
        .bind(item.quantity.to_string())
        .bind(item.unit_price.to_string())
        .bind(item.discount.to_string())
        .bind(item.tax.to_string())
        .bind(item.service_id.as_deref())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn load_items(
    conn: &mut SqliteConnection,
    quote_ids: &[QuoteId],
) -> Result<HashMap<String, Vec<QuoteItem>>, RepositoryError> {
    let mut grouped: HashMap<String, Vec<QuoteItem>> = HashMap::new();
    if quote_ids.is_empty() {
        return Ok(grouped);
    }

    let mut builder = QueryBuilder::<Sqlite>::new(
        "SELECT id, quote_id, description, quantity, unit_price, discount, tax, service_id
         FROM quote_item
         WHERE quote_id IN (",
    );
    let mut separated = builder.separated(", ");
    for id in quote_ids {
        separated.push_bind(id.0.clone());
    }
    builder.push(") ORDER BY quote_id ASC, position ASC");

    for row in builder.build().fetch_all(&mut *conn).await? {
        let item = item_from_row(row)?;
        grouped.entry(item.quote_id.0.clone()).or_default().push(item);
    }
    Ok(grouped)
}

fn quote_from_row(row: SqliteRow) -> Result<Quote, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = QuoteStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown quote status `{status_raw}`")))?;

    Ok(Quote {
        id: QuoteId(row.try_get("id")?),
        contact_id: row.try_get("contact_id")?,
        freelancer_id: row.try_get("freelancer_id")?,
        status,
        valid_until: parse_timestamp("valid_until", row.try_get("valid_until")?)?,
        notes: row.try_get("notes")?,
        folder: row.try_get("folder")?,
        items: Vec::new(),
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn item_from_row(row: SqliteRow) -> Result<QuoteItem, RepositoryError> {
    Ok(QuoteItem {
        id: QuoteItemId(row.try_get("id")?),
        quote_id: QuoteId(row.try_get("quote_id")?),
        description: row.try_get("description")?,
        quantity: parse_decimal("quantity", row.try_get("quantity")?)?,
        unit_price: parse_decimal("unit_price", row.try_get("unit_price")?)?,
        discount: parse_decimal("discount", row.try_get("discount")?)?,
        tax: parse_decimal("tax", row.try_get("tax")?)?,
        service_id: row.try_get("service_id")?,
    })
}
