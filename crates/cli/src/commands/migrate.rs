use quotedesk_core::config::LoadOptions;
use quotedesk_db::{connect_from_config, migrations};

use crate::commands::{
    load_config, runtime, CommandResult, Failure, EXIT_DB_CONNECTIVITY, EXIT_MIGRATION,
};

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match load_config("migrate", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("migrate") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DB_CONNECTIVITY))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), EXIT_MIGRATION))?;
        pool.close().await;
        Ok::<(), Failure>(())
    });

    match result {
        Ok(()) => {
            tracing::info!(event_name = "cli.migrate.completed", "pending migrations applied");
            CommandResult::success("migrate", "applied pending migrations")
        }
        Err(failure) => CommandResult::from_failure("migrate", failure),
    }
}
