//! Configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::memory::{DEFAULT_TOKEN_BUDGET, SimilarityThresholds};
use crate::session::{AgentConfig, SupervisorConfig};

const DEFAULT_POOL_SIZE: usize = 5;

/// Where durable records live.
#[derive(Debug, Clone)]
pub enum DatabaseConfig {
    /// JSON files in the data directory.
    Json,
    Postgres { url: SecretString, pool_size: usize },
}

impl DatabaseConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub database: DatabaseConfig,
    pub agent: AgentConfig,
    pub memory_budget_tokens: usize,
    pub hub_capacity: usize,
    pub max_subscribers: Option<u64>,
    pub thresholds: SimilarityThresholds,
    pub log_json: bool,
}

impl Config {
    /// Load from the process environment (after `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = match get("VIGIL_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .map(|d| d.join("vigil"))
                .ok_or(ConfigError::NoDataDir)?,
        };

        let database = match get("DATABASE_URL") {
            Some(url) => DatabaseConfig::Postgres {
                url: SecretString::from(url),
                pool_size: parse_or(&get, "DATABASE_POOL_SIZE", DEFAULT_POOL_SIZE)?,
            },
            None => DatabaseConfig::Json,
        };

        let defaults = AgentConfig::default();
        let agent = AgentConfig {
            program: get("VIGIL_AGENT_BIN").unwrap_or(defaults.program),
            leading_args: get("VIGIL_AGENT_ARGS")
                .map(|args| args.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            models: [
                get("VIGIL_MODEL_TIER1").unwrap_or_else(|| defaults.models[0].clone()),
                get("VIGIL_MODEL_TIER2").unwrap_or_else(|| defaults.models[1].clone()),
                get("VIGIL_MODEL_TIER3").unwrap_or_else(|| defaults.models[2].clone()),
            ],
            ..defaults
        };

        let thresholds = SimilarityThresholds {
            duplicate: parse_fraction(&get, "VIGIL_DUPLICATE_THRESHOLD", 0.6)?,
            contradiction: parse_fraction(&get, "VIGIL_CONTRADICTION_THRESHOLD", 0.5)?,
        };

        Ok(Self {
            data_dir,
            database,
            agent,
            memory_budget_tokens: parse_or(&get, "VIGIL_MEMORY_BUDGET_TOKENS", DEFAULT_TOKEN_BUDGET)?,
            hub_capacity: parse_or(&get, "VIGIL_HUB_CAPACITY", 256)?,
            max_subscribers: parse_opt(&get, "VIGIL_MAX_SUBSCRIBERS")?,
            thresholds,
            log_json: get("VIGIL_LOG_JSON").is_some_and(|v| is_truthy(&v)),
        })
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            agent: self.agent.clone(),
            logs_dir: self.logs_dir(),
            memory_budget_tokens: self.memory_budget_tokens,
            hub_capacity: self.hub_capacity,
            max_subscribers: self.max_subscribers,
            thresholds: self.thresholds,
        }
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

fn parse_fraction(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f64,
) -> Result<f64, ConfigError> {
    let value: f64 = parse_or(get, key, default)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{} is outside 0.0..=1.0", value),
        });
    }
    Ok(value)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
