use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Care Coordinator";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable prefix for every runtime setting.
const ENV_PREFIX: &str = "CARE_";

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "care_coordinator_lib=info,care_coordinator=info,tower_http=warn"
}

/// Get the application data directory.
/// ~/CareCoordinator/ when a home directory exists, `./CareCoordinator` otherwise.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("CareCoordinator")
}

/// Default location of the analysis report database.
pub fn default_database_path() -> PathBuf {
    app_data_dir().join("analysis.db")
}

/// Default directory holding `<patient_id>.json` files.
pub fn default_patients_dir() -> PathBuf {
    app_data_dir().join("patients")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub patients_dir: PathBuf,
    pub ollama_url: String,
    pub model_name: String,
    /// Timeout for one attempt of one step.
    pub step_timeout: Duration,
    /// Attempts per step, first call included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Ceiling on total wall-clock across all waves of one run.
    pub run_timeout: Duration,
    /// How long a terminal run stays in the registry.
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            database_path: default_database_path(),
            patients_dir: default_patients_dir(),
            ollama_url: "http://localhost:11434".into(),
            model_name: "medgemma:4b".into(),
            step_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            run_timeout: Duration::from_secs(600),
            retention: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    /// Build the configuration from `CARE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup (tests inject a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("BIND_ADDR") {
            config.bind_addr = parse_value("BIND_ADDR", &v)?;
        }
        if let Some(v) = get("DATABASE_PATH") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("PATIENTS_DIR") {
            config.patients_dir = PathBuf::from(v);
        }
        if let Some(v) = get("OLLAMA_URL") {
            config.ollama_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("MODEL") {
            config.model_name = v;
        }
        if let Some(v) = get("STEP_TIMEOUT_SECS") {
            config.step_timeout = Duration::from_secs(parse_positive("STEP_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            let attempts = parse_positive("MAX_ATTEMPTS", &v)?;
            config.max_attempts =
                u32::try_from(attempts).map_err(|e| ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}MAX_ATTEMPTS"),
                    value: v.clone(),
                    reason: e.to_string(),
                })?;
        }
        if let Some(v) = get("BACKOFF_BASE_MS") {
            config.backoff_base = Duration::from_millis(parse_value("BACKOFF_BASE_MS", &v)?);
        }
        if let Some(v) = get("BACKOFF_MAX_MS") {
            config.backoff_max = Duration::from_millis(parse_value("BACKOFF_MAX_MS", &v)?);
        }
        if let Some(v) = get("RUN_TIMEOUT_SECS") {
            config.run_timeout = Duration::from_secs(parse_positive("RUN_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("RETENTION_SECS") {
            config.retention = Duration::from_secs(parse_value("RETENTION_SECS", &v)?);
        }
        if let Some(v) = get("SWEEP_INTERVAL_SECS") {
            config.sweep_interval =
                Duration::from_secs(parse_positive("SWEEP_INTERVAL_SECS", &v)?);
        }

        if config.backoff_max < config.backoff_base {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}BACKOFF_MAX_MS"),
                value: config.backoff_max.as_millis().to_string(),
                reason: "must not be smaller than the backoff base".into(),
            });
        }

        Ok(config)
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{name}"),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive(name: &str, raw: &str) -> Result<u64, ConfigError> {
    let value: u64 = parse_value(name, raw)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{name}"),
            value: raw.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}
