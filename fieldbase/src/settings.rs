use config::{Config, ConfigError, Environment, File, FileFormat};
use dotenv::dotenv;
use serde::Deserialize;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;

use crate::info;

static DOTENV_ONCE: Once = Once::new();

fn ensure_dotenv_loaded() {
    DOTENV_ONCE.call_once(|| {
        match dotenv() {
            Ok(_) => info!("Config loaded including .env file."),
            Err(_) => info!("Config loaded without .env file."),
        }
    });
}

/// What happens to a write when its before-save script throws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BeforeSaveFailure {
    /// Log the failure and persist the pre-script payload.
    #[default]
    Continue,
    /// Abort the write with `SCRIPT_REJECTED`.
    Reject,
}

impl FromStr for BeforeSaveFailure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(BeforeSaveFailure::Continue),
            "reject" => Ok(BeforeSaveFailure::Reject),
            _ => Err(format!("Invalid value for BeforeSaveFailure: {}", s)),
        }
    }
}

impl<'de> serde::Deserialize<'de> for BeforeSaveFailure {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BeforeSaveFailure::from_str(&s).map_err(serde::de::Error::custom)
    }
}

fn duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageSettings,
    pub http: HttpSettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub scripts: ScriptSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub db_path: String,
    pub db_cache_size_mb: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpSettings {
    pub enable: bool,
    pub bind_address: SocketAddr,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QuerySettings {
    pub default_per_page: u64,
    pub max_per_page: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        QuerySettings { default_per_page: 20, max_per_page: 200 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScriptSettings {
    pub max_operations: u64,
    #[serde(rename = "timeout_ms", deserialize_with = "duration_from_millis")]
    pub timeout: Duration,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub before_save_failure: BeforeSaveFailure,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        ScriptSettings {
            max_operations: 100_000,
            timeout: Duration::from_millis(250),
            max_call_levels: 32,
            max_string_size: 64 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
            before_save_failure: BeforeSaveFailure::Continue,
        }
    }
}

/// Settings the engine itself consumes, independent of how the process was launched.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub query: QuerySettings,
    pub scripts: ScriptSettings,
}

impl AppConfig {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        ensure_dotenv_loaded();
        let builder =
            Config::builder()
                .add_source(File::with_name(path).required(true))
                .add_source(Environment::with_prefix("FIELDBASE").try_parsing(true).separator("__"));
        let config = builder.build()?.try_deserialize::<AppConfig>()?;
        info!("{:#?}", config);
        Ok(config)
    }

    /// Parses settings from TOML text only, without `.env` or environment overrides.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Config::builder().add_source(File::from_str(text, FileFormat::Toml)).build()?.try_deserialize::<AppConfig>()
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings { query: self.query.clone(), scripts: self.scripts.clone() }
    }
}
