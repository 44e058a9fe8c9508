use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use quotedesk_core::audit::{
    AuditAction, AuditFilter, AuditLog, AuditLogId, AuditMetadata, AuditPosition,
};
use quotedesk_core::store::{AuditStore, StoreError};

use super::quote::SqlQuoteStore;
use super::{format_timestamp, parse_timestamp, RepositoryError};

pub(crate) async fn insert_audit(
    conn: &mut SqliteConnection,
    log: &AuditLog,
) -> Result<(), RepositoryError> {
    let metadata_json = log
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| RepositoryError::Encode(format!("audit metadata: {error}")))?;

    sqlx::query(
        "INSERT INTO audit_log (
            id, timestamp, actor_id, actor_role, action, module, details, details_folded,
            ip_address, user_agent, metadata_json
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&log.id.0)
    .bind(format_timestamp(&log.timestamp))
    .bind(log.actor_id.as_deref())
    .bind(log.actor_role.as_deref())
    .bind(log.action.as_str())
    .bind(&log.module)
    .bind(&log.details)
    .bind(log.details.to_lowercase())
    .bind(log.ip_address.as_deref())
    .bind(log.user_agent.as_deref())
    .bind(metadata_json)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

impl SqlQuoteStore {
    async fn append(&self, log: &AuditLog) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        insert_audit(&mut conn, log).await
    }

    async fn scan(
        &self,
        filter: &AuditFilter,
        after: Option<&AuditPosition>,
        limit: u32,
    ) -> Result<Vec<AuditLog>, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, timestamp, actor_id, actor_role, action, module, details,
                    ip_address, user_agent, metadata_json
             FROM audit_log
             WHERE 1=1",
        );

        if let Some(range) = &filter.date_range {
            builder.push(" AND timestamp >= ");
            builder.push_bind(format_timestamp(&range.start));
            builder.push(" AND timestamp <= ");
            builder.push_bind(format_timestamp(&range.end));
        }
        if let Some(module) = &filter.module {
            builder.push(" AND module = ");
            builder.push_bind(module.clone());
        }
        if let Some(action) = filter.action {
            builder.push(" AND action = ");
            builder.push_bind(action.as_str());
        }
        if let Some(term) = filter.normalized_search() {
            // SQLite LOWER only folds ASCII; the folded column is written from Rust.
            builder.push(" AND instr(details_folded, ");
            builder.push_bind(term);
            builder.push(") > 0");
        }
        if let Some(position) = after {
            let timestamp = format_timestamp(&position.timestamp);
            builder.push(" AND (timestamp < ");
            builder.push_bind(timestamp.clone());
            builder.push(" OR (timestamp = ");
            builder.push_bind(timestamp);
            builder.push(" AND id < ");
            builder.push_bind(position.id.0.clone());
            builder.push("))");
        }

        builder.push(" ORDER BY timestamp DESC, id DESC LIMIT ");
        builder.push_bind(i64::from(limit));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(audit_from_row).collect()
    }
}

#[async_trait::async_trait]
impl AuditStore for SqlQuoteStore {
    async fn append_audit(&self, log: AuditLog) -> Result<(), StoreError> {
        self.append(&log).await.map_err(|error| match error {
            RepositoryError::Database(error) => StoreError::AuditAppend(error.to_string()),
            other => StoreError::from(other),
        })
    }

    async fn scan_audit(
        &self,
        filter: &AuditFilter,
        after: Option<&AuditPosition>,
        limit: u32,
    ) -> Result<Vec<AuditLog>, StoreError> {
        self.scan(filter, after, limit).await.map_err(StoreError::from)
    }
}

fn audit_from_row(row: SqliteRow) -> Result<AuditLog, RepositoryError> {
    let action_raw = row.try_get::<String, _>("action")?;
    let action = AuditAction::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown audit action `{action_raw}`")))?;

    let metadata = row
        .try_get::<Option<String>, _>("metadata_json")?
        .map(|raw| {
            serde_json::from_str::<AuditMetadata>(&raw)
                .map_err(|error| RepositoryError::Decode(format!("audit metadata: {error}")))
        })
        .transpose()?;

    Ok(AuditLog {
        id: AuditLogId(row.try_get("id")?),
        timestamp: parse_timestamp("timestamp", row.try_get("timestamp")?)?,
        actor_id: row.try_get("actor_id")?,
        actor_role: row.try_get("actor_role")?,
        action,
        module: row.try_get("module")?,
        details: row.try_get("details")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        metadata,
    })
}
