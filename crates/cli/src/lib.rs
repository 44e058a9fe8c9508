pub mod commands;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quotedesk_core::config::{AppConfig, LoadOptions, LogFormat};

#[derive(Debug, Parser)]
#[command(
    name = "quotedesk",
    about = "Quotedesk operator CLI",
    long_about = "Operate the quote lifecycle store: migrations, configuration inspection, expiry sweeps, and read-only quote and audit queries.",
    after_help = "Examples:\n  quotedesk migrate\n  quotedesk expire\n  quotedesk quotes --status pending --page-size 20\n  quotedesk audit --module quotes --action approve"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a quotedesk.toml configuration file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Print the effective configuration with source attribution as JSON")]
    Config,
    #[command(about = "Expire every draft or pending quote whose validity has elapsed")]
    Expire,
    #[command(about = "List one page of quotes as JSON")]
    Quotes(commands::quotes::QuotesArgs),
    #[command(about = "Read audit records, newest first, as JSON")]
    Audit(commands::audit::AuditArgs),
}

pub fn init_logging(config: &AppConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // Output on stdout is the command result; logs never mix into it.
    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

pub fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let options = LoadOptions { config_path: cli.config, ..LoadOptions::default() };

    if let Ok(config) = AppConfig::load(options.clone()) {
        init_logging(&config);
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Config => commands::config::run(&options),
        Command::Expire => commands::expire::run(&options),
        Command::Quotes(args) => commands::quotes::run(&options, args),
        Command::Audit(args) => commands::audit::run(&options, args),
    };

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", result.output).context("failed to write command output")?;
    Ok(ExitCode::from(result.exit_code))
}
