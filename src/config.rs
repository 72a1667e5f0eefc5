use crate::extract::DEFAULT_PREDICTION_HORIZON_SECONDS;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/trip-update-events/config.json";
pub const DEFAULT_SOURCE_TAG: &str = "RT_TRIP_UPDATES";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("TU_EVENTS_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    db_pool_size: Option<u32>,
    #[serde(default)]
    source_tag: Option<String>,
    #[serde(default)]
    batch_root: Option<String>,
    #[serde(default)]
    prediction_horizon_seconds: Option<i64>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "trip-update-events failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_config(contents).or_else(|| {
        tracing::warn!(
            path = %path.display(),
            "trip-update-events failed to parse setup config; using env defaults"
        );
        None
    })
}

fn parse_setup_config(contents: String) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes).ok()
}

fn env_allows(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_none()
}

fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    if env_allows("TU_EVENTS_DB_POOL_SIZE") {
        if let Some(value) = overrides.db_pool_size.filter(|v| *v != 0) {
            config.db_pool_size = value;
        }
    }
    if env_allows("TU_EVENTS_SOURCE_TAG") {
        if let Some(tag) = overrides
            .source_tag
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.source_tag = tag.to_string();
        }
    }
    if env_allows("TU_EVENTS_BATCH_ROOT") {
        if let Some(root) = overrides
            .batch_root
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.batch_root = PathBuf::from(root);
        }
    }
    if env_allows("TU_EVENTS_PREDICTION_HORIZON_SECONDS") {
        if let Some(value) = overrides.prediction_horizon_seconds.filter(|v| *v > 0) {
            config.prediction_horizon_seconds = value;
        }
    }
    if env_allows("TU_EVENTS_POLL_INTERVAL_MS") {
        if let Some(value) = overrides.poll_interval_ms.filter(|v| *v != 0) {
            config.poll_interval_ms = value;
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub source_tag: String,
    pub batch_root: PathBuf,
    pub prediction_horizon_seconds: i64,
    pub poll_interval_ms: u64,
    pub run_once: bool,
    pub bootstrap_schema: bool,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = env::var("TU_EVENTS_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .context("TU_EVENTS_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let db_pool_size = env::var("TU_EVENTS_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(5);
        let source_tag =
            env::var("TU_EVENTS_SOURCE_TAG").unwrap_or_else(|_| DEFAULT_SOURCE_TAG.to_string());
        let batch_root = env::var("TU_EVENTS_BATCH_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let prediction_horizon_seconds = env::var("TU_EVENTS_PREDICTION_HORIZON_SECONDS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_PREDICTION_HORIZON_SECONDS);
        let poll_interval_ms = env::var("TU_EVENTS_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5000);
        let run_once = env_flag("TU_EVENTS_RUN_ONCE");
        let bootstrap_schema = env_flag("TU_EVENTS_BOOTSTRAP_SCHEMA");
        let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        let mut config = Self {
            database_url,
            db_pool_size,
            source_tag,
            batch_root,
            prediction_horizon_seconds,
            poll_interval_ms,
            run_once,
            bootstrap_schema,
            otlp_endpoint,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, env_allows);
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg2://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
