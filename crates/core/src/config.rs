//! Layered configuration: built-in defaults, then an optional TOML file, then
//! `QUOTEDESK_*` environment variables, then programmatic overrides.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Serialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub query: QueryConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct StoreConfig {
    /// Upper bound for a single backing-store call.
    pub timeout_ms: u64,
    /// Automatic re-reads after a version conflict when the caller did not pin a version.
    pub max_conflict_retries: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueryConfig {
    pub max_page_size: u32,
    pub audit_batch_size: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("`{other}` is not one of compact|pretty|json")),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub store_timeout_ms: Option<u64>,
    pub max_conflict_retries: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

/// Where a setting was read from, for error reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettingOrigin {
    File(PathBuf),
    Env(&'static str),
}

impl fmt::Display for SettingOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file `{}`", path.display()),
            Self::Env(key) => write!(f, "env `{key}`"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("config file not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("`${{{var}}}` is referenced by the config file but not set")]
    MissingEnvInterpolation { var: String },
    #[error("`${{` without a closing `}}` in config file")]
    UnterminatedInterpolation,
    #[error("invalid value for `{field}` from {origin}: {message}")]
    InvalidValue { field: &'static str, origin: SettingOrigin, message: String },
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Every setting as `(dotted field, environment variable)`.
pub const FIELDS: &[(&str, &str)] = &[
    ("database.url", "QUOTEDESK_DATABASE_URL"),
    ("database.max_connections", "QUOTEDESK_DATABASE_MAX_CONNECTIONS"),
    ("database.timeout_secs", "QUOTEDESK_DATABASE_TIMEOUT_SECS"),
    ("store.timeout_ms", "QUOTEDESK_STORE_TIMEOUT_MS"),
    ("store.max_conflict_retries", "QUOTEDESK_STORE_MAX_CONFLICT_RETRIES"),
    ("query.max_page_size", "QUOTEDESK_QUERY_MAX_PAGE_SIZE"),
    ("query.audit_batch_size", "QUOTEDESK_QUERY_AUDIT_BATCH_SIZE"),
    ("logging.level", "QUOTEDESK_LOGGING_LEVEL"),
    ("logging.format", "QUOTEDESK_LOGGING_FORMAT"),
];

/// Short spellings accepted for the logging variables.
const ENV_ALIASES: &[(&str, &str)] = &[
    ("logging.level", "QUOTEDESK_LOG_LEVEL"),
    ("logging.format", "QUOTEDESK_LOG_FORMAT"),
];

const DEFAULT_FILES: [&str; 2] = ["quotedesk.toml", "config/quotedesk.toml"];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://quotedesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            store: StoreConfig { timeout_ms: 5_000, max_conflict_retries: 3 },
            query: QueryConfig { max_page_size: 200, audit_batch_size: 100 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        match locate_file(options.config_path.as_deref()) {
            Some(path) => config.merge_file(&path)?,
            None if options.require_file => {
                let expected =
                    options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_FILES[0]));
                return Err(ConfigError::MissingConfigFile(expected));
            }
            None => {}
        }

        config.merge_env()?;
        config.merge_overrides(options.overrides);
        config.validate()?;
        Ok(config)
    }

    /// The config file that `load` would read, if any.
    pub fn locate_file(explicit: Option<&Path>) -> Option<PathBuf> {
        locate_file(explicit)
    }

    /// Current value of a dotted field, rendered as text.
    pub fn field_value(&self, field: &str) -> Option<String> {
        let value = match field {
            "database.url" => self.database.url.clone(),
            "database.max_connections" => self.database.max_connections.to_string(),
            "database.timeout_secs" => self.database.timeout_secs.to_string(),
            "store.timeout_ms" => self.store.timeout_ms.to_string(),
            "store.max_conflict_retries" => self.store.max_conflict_retries.to_string(),
            "query.max_page_size" => self.query.max_page_size.to_string(),
            "query.audit_batch_size" => self.query.audit_batch_size.to_string(),
            "logging.level" => self.logging.level.clone(),
            "logging.format" => self.logging.format.to_string(),
            _ => return None,
        };
        Some(value)
    }

    fn set_field(
        &mut self,
        field: &'static str,
        raw: &str,
        origin: SettingOrigin,
    ) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            field,
            origin: origin.clone(),
            message,
        };
        let raw = raw.trim();

        match field {
            "database.url" => self.database.url = raw.to_string(),
            "database.max_connections" => {
                self.database.max_connections = number(raw).map_err(invalid)?
            }
            "database.timeout_secs" => self.database.timeout_secs = number(raw).map_err(invalid)?,
            "store.timeout_ms" => self.store.timeout_ms = number(raw).map_err(invalid)?,
            "store.max_conflict_retries" => {
                self.store.max_conflict_retries = number(raw).map_err(invalid)?
            }
            "query.max_page_size" => self.query.max_page_size = number(raw).map_err(invalid)?,
            "query.audit_batch_size" => {
                self.query.audit_batch_size = number(raw).map_err(invalid)?
            }
            "logging.level" => self.logging.level = raw.to_ascii_lowercase(),
            "logging.format" => self.logging.format = raw.parse().map_err(invalid)?,
            _ => {}
        }
        Ok(())
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
        let table: toml::Table = toml::from_str(&interpolate(&raw)?)
            .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })?;

        for &(field, _) in FIELDS {
            let Some((section, key)) = field.split_once('.') else {
                continue;
            };
            let Some(value) = table.get(section).and_then(|section| section.get(key)) else {
                continue;
            };
            let origin = SettingOrigin::File(path.to_path_buf());
            let text = match value {
                toml::Value::String(text) => text.clone(),
                toml::Value::Integer(number) => number.to_string(),
                other => {
                    return Err(ConfigError::InvalidValue {
                        field,
                        origin,
                        message: format!("expected a string or integer, found {}", other.type_str()),
                    })
                }
            };
            self.set_field(field, &text, origin)?;
        }
        Ok(())
    }

    fn merge_env(&mut self) -> Result<(), ConfigError> {
        // Aliases first so the long spelling wins when both are set.
        for &(field, key) in ENV_ALIASES.iter().chain(FIELDS) {
            if let Some(value) = env_value(key) {
                self.set_field(field, &value, SettingOrigin::Env(key))?;
            }
        }
        Ok(())
    }

    fn merge_overrides(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            database_url,
            log_level,
            log_format,
            store_timeout_ms,
            max_conflict_retries,
        } = overrides;

        self.database.url = database_url.unwrap_or_else(|| self.database.url.clone());
        self.logging.level = log_level.unwrap_or_else(|| self.logging.level.clone());
        self.logging.format = log_format.unwrap_or(self.logging.format);
        self.store.timeout_ms = store_timeout_ms.unwrap_or(self.store.timeout_ms);
        self.store.max_conflict_retries =
            max_conflict_retries.unwrap_or(self.store.max_conflict_retries);
    }

    /// Reports every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let url = self.database.url.trim();
        if !(url.starts_with("sqlite:") || url == ":memory:") {
            problems.push(format!("database.url `{url}` is not a sqlite URL"));
        }
        if self.database.max_connections == 0 {
            problems.push("database.max_connections must be at least 1".to_string());
        }
        if !(1..=300).contains(&self.database.timeout_secs) {
            problems.push("database.timeout_secs must be within 1..=300".to_string());
        }
        if !(1..=300_000).contains(&self.store.timeout_ms) {
            problems.push("store.timeout_ms must be within 1..=300000".to_string());
        }
        if self.store.max_conflict_retries > 10 {
            problems.push("store.max_conflict_retries must not exceed 10".to_string());
        }
        if self.query.max_page_size == 0 {
            problems.push("query.max_page_size must be at least 1".to_string());
        }
        if self.query.audit_batch_size == 0 {
            problems.push("query.audit_batch_size must be at least 1".to_string());
        }
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            problems.push(format!(
                "logging.level `{}` is not one of trace|debug|info|warn|error",
                self.logging.level
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems))
        }
    }
}

fn locate_file(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => path.exists().then(|| path.to_path_buf()),
        None => DEFAULT_FILES.iter().map(PathBuf::from).find(|path| path.exists()),
    }
}

/// Replaces each `${NAME}` with the value of the environment variable `NAME`.
fn interpolate(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or(ConfigError::UnterminatedInterpolation)?;
        let name = &after[..end];
        let value = env::var(name)
            .map_err(|_| ConfigError::MissingEnvInterpolation { var: name.to_string() })?;
        output.push_str(&value);
        rest = &after[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn number<T>(raw: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse::<T>().map_err(|error| format!("`{raw}` is not a valid number ({error})"))
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, SettingOrigin};

    const TOUCHED: &[&str] = &[
        "QUOTEDESK_DATABASE_URL",
        "QUOTEDESK_STORE_TIMEOUT_MS",
        "QUOTEDESK_QUERY_MAX_PAGE_SIZE",
        "QUOTEDESK_LOGGING_LEVEL",
        "QUOTEDESK_LOG_LEVEL",
        "QUOTEDESK_LOG_FORMAT",
        "QUOTEDESK_TEST_DB",
    ];

    /// Serializes tests that touch process env and clears it on both ends.
    struct EnvScope {
        _guard: MutexGuard<'static, ()>,
    }

    impl EnvScope {
        fn enter(vars: &[(&str, &str)]) -> Self {
            static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
            let guard = match LOCK.get_or_init(|| Mutex::new(())).lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for key in TOUCHED {
                env::remove_var(key);
            }
            for (key, value) in vars {
                env::set_var(key, value);
            }
            Self { _guard: guard }
        }
    }

    impl Drop for EnvScope {
        fn drop(&mut self) {
            for key in TOUCHED {
                env::remove_var(key);
            }
        }
    }

    fn write_file(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("quotedesk.toml");
        fs::write(&path, body).expect("write config file");
        path
    }

    fn load_from(path: PathBuf) -> Result<AppConfig, ConfigError> {
        AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
    }

    #[test]
    fn defaults_pass_validation() {
        let _env = EnvScope::enter(&[]);

        let config = AppConfig::load(LoadOptions::default()).expect("defaults load");
        assert_eq!(config.store.timeout_ms, 5_000);
        assert_eq!(config.store.max_conflict_retries, 3);
        assert_eq!(config.query.max_page_size, 200);
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn file_values_are_interpolated_from_env() {
        let _env = EnvScope::enter(&[("QUOTEDESK_TEST_DB", "sqlite://interpolated.db")]);
        let dir = TempDir::new().expect("temp dir");
        let path = write_file(
            &dir,
            "[database]\nurl = \"${QUOTEDESK_TEST_DB}\"\n\n[query]\nmax_page_size = 50\n",
        );

        let config = load_from(path).expect("load");
        assert_eq!(config.database.url, "sqlite://interpolated.db");
        assert_eq!(config.query.max_page_size, 50);
    }

    #[test]
    fn unset_interpolation_variable_is_named() {
        let _env = EnvScope::enter(&[]);
        let dir = TempDir::new().expect("temp dir");
        let path = write_file(&dir, "[database]\nurl = \"${QUOTEDESK_TEST_DB}\"\n");

        let error = load_from(path).expect_err("must fail");
        assert!(matches!(
            error,
            ConfigError::MissingEnvInterpolation { ref var } if var == "QUOTEDESK_TEST_DB"
        ));
    }

    #[test]
    fn unterminated_interpolation_is_rejected() {
        let _env = EnvScope::enter(&[]);
        let dir = TempDir::new().expect("temp dir");
        let path = write_file(&dir, "[database]\nurl = \"${QUOTEDESK_TEST_DB\"\n");

        assert!(matches!(load_from(path), Err(ConfigError::UnterminatedInterpolation)));
    }

    #[test]
    fn short_logging_variables_are_honoured() {
        let _env =
            EnvScope::enter(&[("QUOTEDESK_LOG_LEVEL", "WARN"), ("QUOTEDESK_LOG_FORMAT", "json")]);

        let config = AppConfig::load(LoadOptions::default()).expect("load");
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn long_logging_variable_wins_over_alias() {
        let _env = EnvScope::enter(&[
            ("QUOTEDESK_LOG_LEVEL", "warn"),
            ("QUOTEDESK_LOGGING_LEVEL", "debug"),
        ]);

        let config = AppConfig::load(LoadOptions::default()).expect("load");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn overrides_beat_env_which_beats_file() {
        let _env = EnvScope::enter(&[
            ("QUOTEDESK_DATABASE_URL", "sqlite://from-env.db"),
            ("QUOTEDESK_STORE_TIMEOUT_MS", "750"),
        ]);
        let dir = TempDir::new().expect("temp dir");
        let path = write_file(
            &dir,
            "[database]\nurl = \"sqlite://from-file.db\"\n\n[store]\ntimeout_ms = 1500\nmax_conflict_retries = 1\n\n[logging]\nlevel = \"warn\"\n",
        );

        let config = AppConfig::load(LoadOptions {
            config_path: Some(path),
            overrides: ConfigOverrides {
                database_url: Some("sqlite://from-override.db".to_string()),
                log_level: Some("debug".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("load");

        assert_eq!(config.database.url, "sqlite://from-override.db");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.store.timeout_ms, 750);
        assert_eq!(config.store.max_conflict_retries, 1);
    }

    #[test]
    fn validation_lists_every_problem() {
        let _env = EnvScope::enter(&[("QUOTEDESK_DATABASE_URL", "postgres://elsewhere")]);

        let error = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides { store_timeout_ms: Some(0), ..ConfigOverrides::default() },
            ..LoadOptions::default()
        })
        .expect_err("must fail");

        let problems = match error {
            ConfigError::Validation(problems) => problems,
            other => panic!("expected validation error, got {other}"),
        };
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("database.url"));
        assert!(problems[1].contains("store.timeout_ms"));
    }

    #[test]
    fn non_numeric_env_value_names_its_origin() {
        let _env = EnvScope::enter(&[("QUOTEDESK_QUERY_MAX_PAGE_SIZE", "lots")]);

        let error = AppConfig::load(LoadOptions::default()).expect_err("must fail");
        assert!(matches!(
            error,
            ConfigError::InvalidValue {
                field: "query.max_page_size",
                origin: SettingOrigin::Env("QUOTEDESK_QUERY_MAX_PAGE_SIZE"),
                ..
            }
        ));
    }

    #[test]
    fn required_file_must_exist() {
        let _env = EnvScope::enter(&[]);
        let dir = TempDir::new().expect("temp dir");
        let missing = dir.path().join("absent.toml");

        let error = AppConfig::load(LoadOptions {
            config_path: Some(missing.clone()),
            require_file: true,
            ..LoadOptions::default()
        })
        .expect_err("must fail");
        assert!(matches!(error, ConfigError::MissingConfigFile(path) if path == missing));
    }

    #[test]
    fn field_values_render_for_every_known_field() {
        let config = AppConfig::default();
        for &(field, _) in super::FIELDS {
            assert!(config.field_value(field).is_some(), "{field} should render");
        }
        assert_eq!(config.field_value("logging.format").as_deref(), Some("compact"));
        assert_eq!(config.field_value("nope"), None);
    }
}
