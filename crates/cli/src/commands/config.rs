use std::env;
use std::fs;
use std::path::Path;

use quotedesk_core::config::{AppConfig, LoadOptions, FIELDS};
use serde::Serialize;

use crate::commands::{load_config, to_json, CommandResult};

#[derive(Debug, Serialize)]
struct ConfigEntry {
    key: &'static str,
    value: String,
    source: String,
}

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match load_config("config", options) {
        Ok(config) => config,
        Err(result) => return result,
    };

    let file = AppConfig::locate_file(options.config_path.as_deref());
    let file_table = file.as_deref().and_then(read_table);

    let entries: Vec<ConfigEntry> = FIELDS
        .iter()
        .map(|&(key, env_key)| ConfigEntry {
            key,
            value: config.field_value(key).unwrap_or_default(),
            source: source_of(key, env_key, file.as_deref(), file_table.as_ref()),
        })
        .collect();

    match to_json(&entries) {
        Ok(data) => CommandResult::success_with(
            "config",
            "effective config (source precedence: env > file > default)",
            Some(data),
        ),
        Err(failure) => CommandResult::from_failure("config", failure),
    }
}

fn read_table(path: &Path) -> Option<toml::Table> {
    fs::read_to_string(path).ok()?.parse::<toml::Table>().ok()
}

fn source_of(
    key: &str,
    env_key: &str,
    file: Option<&Path>,
    table: Option<&toml::Table>,
) -> String {
    let alias = match key {
        "logging.level" => Some("QUOTEDESK_LOG_LEVEL"),
        "logging.format" => Some("QUOTEDESK_LOG_FORMAT"),
        _ => None,
    };
    if let Some(set) = [Some(env_key), alias].into_iter().flatten().find(|name| is_set(name)) {
        return format!("env ({set})");
    }

    let in_file = key
        .split_once('.')
        .and_then(|(section, field)| table?.get(section)?.get(field))
        .is_some();
    match file {
        Some(path) if in_file => format!("file ({})", path.display()),
        _ => "default".to_string(),
    }
}

fn is_set(name: &str) -> bool {
    env::var(name).is_ok_and(|value| !value.trim().is_empty())
}
