use std::sync::Arc;

use quotedesk_core::config::LoadOptions;
use quotedesk_core::service::{ExpirySweep, QuoteService, ServiceSettings};
use serde_json::json;

use crate::commands::{
    application_failure, load_config, open_store, runtime, CommandResult, EXIT_REJECTED,
    EXIT_RETRYABLE,
};

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match load_config("expire", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("expire") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let store = open_store(&config).await?;
        let service = QuoteService::with_system_clock(
            Arc::new(store),
            ServiceSettings::from_config(&config),
        );
        service.expire_overdue().await.map_err(application_failure)
    });

    match result {
        Ok(sweep) => render(sweep),
        Err(failure) => CommandResult::from_failure("expire", failure),
    }
}

fn render(sweep: ExpirySweep) -> CommandResult {
    let all_retryable = sweep.failed.iter().all(|(_, error)| error.is_retryable());
    let data = json!({
        "expired": sweep.expired.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "failed": sweep
            .failed
            .iter()
            .map(|(id, error)| json!({
                "quote_id": id.to_string(),
                "error_class": error.kind().as_str(),
                "message": error.to_string(),
            }))
            .collect::<Vec<_>>(),
    });

    if sweep.failed.is_empty() {
        return CommandResult::success_with(
            "expire",
            format!("expired {} quotes", sweep.expired.len()),
            Some(data),
        );
    }

    let exit_code = if all_retryable { EXIT_RETRYABLE } else { EXIT_REJECTED };
    CommandResult::failure_with(
        "expire",
        "partial_expiry",
        format!(
            "expired {} quotes, {} could not be expired",
            sweep.expired.len(),
            sweep.failed.len()
        ),
        exit_code,
        Some(data),
    )
}
