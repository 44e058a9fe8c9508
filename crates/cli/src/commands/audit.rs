use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use clap::Args;
use quotedesk_core::audit::{AuditAction, AuditFilter, AuditLog, DateRange};
use quotedesk_core::config::LoadOptions;
use quotedesk_core::domain::actor::{Actor, Capability};
use quotedesk_core::service::{QuoteService, ServiceSettings};

use crate::commands::{
    application_failure, load_config, open_store, runtime, to_json, validation_failure,
    CommandResult, Failure,
};

#[derive(Debug, Clone, Args)]
pub struct AuditArgs {
    #[arg(long)]
    pub module: Option<String>,
    #[arg(long)]
    pub action: Option<String>,
    #[arg(long)]
    pub search: Option<String>,
    /// Inclusive lower bound, RFC 3339.
    #[arg(long)]
    pub from: Option<String>,
    /// Inclusive upper bound, RFC 3339.
    #[arg(long)]
    pub to: Option<String>,
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
    #[arg(long, default_value = "cli-operator")]
    pub actor_id: String,
}

pub fn run(options: &LoadOptions, args: AuditArgs) -> CommandResult {
    let config = match load_config("audit", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let filter = match filter(&args) {
        Ok(filter) => filter,
        Err(failure) => return CommandResult::from_failure("audit", failure),
    };
    let runtime = match runtime("audit") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let actor = Actor::new(args.actor_id, "operator", [Capability::Read]);
    let limit = args.limit;
    let result = runtime.block_on(async {
        let store = open_store(&config).await?;
        let service =
            QuoteService::with_system_clock(Arc::new(store), ServiceSettings::from_config(&config));
        let mut cursor = service.query_audit(&actor, filter).map_err(application_failure)?;

        let mut records: Vec<AuditLog> = Vec::new();
        while records.len() < limit {
            match cursor.next().await.map_err(application_failure)? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Ok::<_, Failure>(records)
    });

    match result.and_then(|records| Ok((records.len(), to_json(&records)?))) {
        Ok((count, data)) => {
            CommandResult::success_with("audit", format!("{count} audit records"), Some(data))
        }
        Err(failure) => CommandResult::from_failure("audit", failure),
    }
}

fn filter(args: &AuditArgs) -> Result<AuditFilter, Failure> {
    let action = match args.action.as_deref() {
        Some(raw) => Some(
            AuditAction::parse(raw)
                .ok_or_else(|| validation_failure(format!("unknown audit action `{raw}`")))?,
        ),
        None => None,
    };

    let date_range = match (args.from.as_deref(), args.to.as_deref()) {
        (None, None) => None,
        (from, to) => {
            let start = match from {
                Some(raw) => parse_instant("from", raw)?,
                None => open_bound(1970, 1, 1, 0, 0, 0)?,
            };
            let end = match to {
                Some(raw) => parse_instant("to", raw)?,
                None => open_bound(9999, 12, 31, 23, 59, 59)?,
            };
            Some(DateRange { start, end })
        }
    };

    Ok(AuditFilter {
        date_range,
        module: args.module.clone(),
        action,
        search_term: args.search.clone(),
    })
}

fn parse_instant(flag: &str, raw: &str) -> Result<DateTime<Utc>, Failure> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|at| at.with_timezone(&Utc))
        .map_err(|error| validation_failure(format!("--{flag} `{raw}` is not RFC 3339: {error}")))
}

// Open ends stay within four-digit years so stored timestamps compare as text.
fn open_bound(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Result<DateTime<Utc>, Failure> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .ok_or_else(|| validation_failure("date range bound out of range"))
}
