use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumString};
use typed_builder::TypedBuilder;
use validator::{Validate, ValidationError};

const DEFAULT_SERVICE_NAME: &str = "fhevm";

lazy_static::lazy_static! {
    pub(crate) static ref ENVIRONMENT: ExecutionEnvironment = mode();
}

#[derive(
    Default, Display, Deserialize, Serialize, Clone, Copy, EnumString, AsRefStr, Eq, PartialEq, Debug,
)]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionEnvironment {
    #[default]
    Local,
    #[strum(serialize = "dev")]
    Development,
    Stage,
    #[strum(serialize = "prod")]
    Production,
    Integration,
}

fn mode() -> ExecutionEnvironment {
    env::var("RUN_MODE")
        .map(|enum_str| ExecutionEnvironment::from_str(enum_str.as_str()).unwrap_or_default())
        .unwrap_or_else(|_| ExecutionEnvironment::Local)
}

/// The environment selected through `RUN_MODE`, `local` when unset or unknown.
pub fn execution_environment() -> ExecutionEnvironment {
    *ENVIRONMENT
}

fn validate_log_filter(filter: &str) -> Result<(), ValidationError> {
    tracing_subscriber::EnvFilter::try_new(filter)
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_log_filter"))
}

/// How logs are emitted.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, TypedBuilder, Validate)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Name recorded with every log line.
    #[builder(default = DEFAULT_SERVICE_NAME.to_string(), setter(into))]
    #[serde(default = "default_service_name")]
    #[validate(length(min = 1))]
    tracing_service_name: String,

    /// `EnvFilter` directives such as `info,fhevm_instance=debug`. Takes precedence
    /// over `RUST_LOG`.
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    #[validate(custom(function = "validate_log_filter"))]
    log_filter: Option<String>,

    /// Emit JSON lines on stdout instead of human readable text.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    json_logs: Option<bool>,

    /// Also write JSON logs to this file.
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    log_file: Option<PathBuf>,
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig::builder().build()
    }
}

impl TelemetryConfig {
    pub fn tracing_service_name(&self) -> &str {
        &self.tracing_service_name
    }

    pub fn log_filter(&self) -> Option<&str> {
        self.log_filter.as_deref()
    }

    pub fn json_logs(&self) -> bool {
        self.json_logs.unwrap_or(false)
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

#[derive(TypedBuilder, Debug)]
pub struct Settings<'a> {
    #[builder(setter(strip_option), default = None)]
    path: Option<&'a str>,
    env_prefix: &'a str,
    #[builder(default)]
    parse_keys: Vec<&'a str>,
}

impl Settings<'_> {
    /// Load `T` from, in increasing order of precedence: `config/default`,
    /// `config/<prefix>`, `config/<prefix>-<RUN_MODE>`, the explicit path if any, and
    /// `<PREFIX>__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required source is missing or the merged configuration
    /// cannot be deserialized into `T`.
    pub fn init_conf<'de, T: Deserialize<'de> + std::fmt::Debug>(&self) -> Result<T, ConfigError> {
        let mut env_conf = config::Environment::default()
            .prefix(self.env_prefix)
            .separator("__")
            .list_separator(",");
        if !self.parse_keys.is_empty() {
            env_conf = env_conf.try_parsing(true);
        }
        for key in &self.parse_keys {
            env_conf = env_conf.with_list_parse_key(key);
        }
        let prefix = self.env_prefix.to_lowercase();
        let mut config_builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{prefix}")).required(false))
            .add_source(
                File::with_name(&format!("config/{prefix}-{}", *ENVIRONMENT)).required(false),
            );

        if let Some(path) = self.path {
            config_builder = config_builder.add_source(File::with_name(path).required(true))
        };

        let config = config_builder.add_source(env_conf).build()?;
        let settings: T = config.try_deserialize()?;
        tracing::debug!("loaded settings: {:?}", settings);
        Ok(settings)
    }
}
