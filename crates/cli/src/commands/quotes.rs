use std::collections::BTreeMap;
use std::sync::Arc;

use clap::Args;
use quotedesk_core::config::LoadOptions;
use quotedesk_core::domain::actor::{Actor, Capability};
use quotedesk_core::domain::quote::Quote;
use quotedesk_core::query::{
    ListParams, PaginatedResponse, QuoteFilters, SortDirection, SortField, Sorting,
};
use quotedesk_core::service::{QuoteService, ServiceSettings};
use serde::Serialize;

use crate::commands::{
    application_failure, load_config, open_store, runtime, to_json, validation_failure,
    CommandResult, Failure,
};

#[derive(Debug, Clone, Args)]
pub struct QuotesArgs {
    #[arg(long, default_value_t = 1)]
    pub page: u32,
    #[arg(long, default_value_t = 20)]
    pub page_size: u32,
    /// Comma separated list of statuses, e.g. `draft,pending`.
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long)]
    pub search: Option<String>,
    #[arg(long)]
    pub contact_id: Option<String>,
    #[arg(long)]
    pub folder: Option<String>,
    #[arg(long, value_name = "FIELD")]
    pub sort: Option<String>,
    #[arg(long, value_name = "asc|desc")]
    pub direction: Option<String>,
    /// Additional `key=value` filter, repeatable.
    #[arg(long = "filter", value_name = "KEY=VALUE")]
    pub filters: Vec<String>,
    #[arg(long, default_value = "cli-operator")]
    pub actor_id: String,
}

#[derive(Debug, Serialize)]
struct QuoteRow {
    #[serde(flatten)]
    quote: Quote,
    total_amount: String,
}

pub fn run(options: &LoadOptions, args: QuotesArgs) -> CommandResult {
    let config = match load_config("quotes", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let params = match list_params(&args) {
        Ok(params) => params,
        Err(failure) => return CommandResult::from_failure("quotes", failure),
    };
    let runtime = match runtime("quotes") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let actor = Actor::new(args.actor_id, "operator", [Capability::Read]);
    let result = runtime.block_on(async {
        let store = open_store(&config).await?;
        let service =
            QuoteService::with_system_clock(Arc::new(store), ServiceSettings::from_config(&config));
        let page = service.list(&actor, params).await.map_err(application_failure)?;
        rows(page)
    });

    match result {
        Ok(page) => {
            let message = format!(
                "page {} of {} matching quotes",
                page.page, page.total_count
            );
            match to_json(&page) {
                Ok(data) => CommandResult::success_with("quotes", message, Some(data)),
                Err(failure) => CommandResult::from_failure("quotes", failure),
            }
        }
        Err(failure) => CommandResult::from_failure("quotes", failure),
    }
}

fn list_params(args: &QuotesArgs) -> Result<ListParams, Failure> {
    let mut params = BTreeMap::new();
    for raw in &args.filters {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| validation_failure(format!("filter `{raw}` must be KEY=VALUE")))?;
        params.insert(key.trim().to_string(), value.to_string());
    }
    let named = [
        (QuoteFilters::STATUS, &args.status),
        (QuoteFilters::SEARCH, &args.search),
        (QuoteFilters::CONTACT_ID, &args.contact_id),
        (QuoteFilters::FOLDER, &args.folder),
    ];
    for (key, value) in named {
        if let Some(value) = value {
            params.insert(key.to_string(), value.clone());
        }
    }

    let filters = QuoteFilters::from_params(&params)
        .map_err(|error| application_failure(error.into()))?;
    let sorting = sorting(args.sort.as_deref(), args.direction.as_deref())?;

    let mut list = ListParams::new(args.page, args.page_size);
    list.filters = filters;
    list.sorting = sorting;
    Ok(list)
}

fn sorting(field: Option<&str>, direction: Option<&str>) -> Result<Option<Sorting>, Failure> {
    if field.is_none() && direction.is_none() {
        return Ok(None);
    }
    let defaults = Sorting::default();
    let field = match field {
        Some(raw) => SortField::parse(raw)
            .ok_or_else(|| validation_failure(format!("unknown sort field `{raw}`")))?,
        None => defaults.field,
    };
    let direction = match direction {
        Some(raw) => SortDirection::parse(raw)
            .ok_or_else(|| validation_failure(format!("unknown sort direction `{raw}`")))?,
        None => defaults.direction,
    };
    Ok(Some(Sorting { field, direction }))
}

fn rows(page: PaginatedResponse<Quote>) -> Result<PaginatedResponse<QuoteRow>, Failure> {
    let PaginatedResponse { data, total_count, page, page_size, has_more } = page;
    let data = data
        .into_iter()
        .map(|quote| {
            let total_amount = quote
                .total_amount()
                .map_err(|error| application_failure(error.into()))?
                .to_string();
            Ok(QuoteRow { quote, total_amount })
        })
        .collect::<Result<Vec<_>, Failure>>()?;
    Ok(PaginatedResponse { data, total_count, page, page_size, has_more })
}
