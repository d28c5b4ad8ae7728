use crate::dispatch::{default_vent_pattern, Interlock};
use crate::ingest::DEFAULT_BUCKET_RESOLUTION_MS;
use crate::session::AggregateDefaults;
use crate::stats::{OutlierMethod, DEFAULT_WARMUP_SECS, DEFAULT_Z_THRESHOLD};
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/pump-bench/config.json";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("BENCH_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Ok(state_dir) = std::env::var("BENCH_SETUP_STATE_DIR") {
        let trimmed = state_dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join("config.json");
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    stale_after_ms: Option<u64>,
    #[serde(default)]
    bucket_resolution_ms: Option<u64>,
    #[serde(default)]
    z_threshold: Option<f64>,
    #[serde(default)]
    warmup_secs: Option<f64>,
    #[serde(default)]
    outlier_method: Option<OutlierMethod>,
    #[serde(default)]
    interlocks: Option<Vec<Interlock>>,
    #[serde(default)]
    emergency_vent_valves: Option<BTreeMap<String, bool>>,
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
                "bench-sidecar failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "bench-sidecar failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

/// Setup file values apply only where the matching env var is unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    if env_allows("BENCH_DATABASE_URL") {
        if let Some(url) = overrides
            .database_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.database_url = Some(normalize_database_url(url.to_string()));
        }
    }
    if env_allows("BENCH_MQTT_HOST") {
        if let Some(host) = overrides
            .mqtt_host
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.mqtt_host = host.to_string();
        }
    }
    if env_allows("BENCH_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if let Some(username) = overrides.mqtt_username.as_deref() {
        let trimmed = username.trim();
        config.mqtt_username = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }
    if let Some(password) = overrides.mqtt_password.as_deref() {
        let trimmed = password.trim();
        config.mqtt_password = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }
    if env_allows("BENCH_MQTT_TOPIC_PREFIX") {
        if let Some(prefix) = overrides
            .mqtt_topic_prefix
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.mqtt_topic_prefix = prefix.to_string();
        }
    }

    if env_allows("BENCH_STALE_AFTER_MS") {
        if let Some(value) = overrides.stale_after_ms.filter(|v| *v != 0) {
            config.stale_after_ms = value;
        }
    }
    if env_allows("BENCH_BUCKET_RESOLUTION_MS") {
        if let Some(value) = overrides.bucket_resolution_ms.filter(|v| *v != 0) {
            config.bucket_resolution_ms = value;
        }
    }
    if env_allows("BENCH_Z_THRESHOLD") {
        if let Some(value) = overrides.z_threshold.filter(|v| v.is_finite() && *v > 0.0) {
            config.z_threshold = value;
        }
    }
    if env_allows("BENCH_WARMUP_SECS") {
        if let Some(value) = overrides.warmup_secs.filter(|v| v.is_finite() && *v >= 0.0) {
            config.warmup_secs = value;
        }
    }
    if env_allows("BENCH_OUTLIER_METHOD") {
        if let Some(method) = overrides.outlier_method {
            config.outlier_method = method;
        }
    }
    if env_allows("BENCH_INTERLOCKS") {
        if let Some(interlocks) = &overrides.interlocks {
            config.interlocks = interlocks.clone();
        }
    }
    if env_allows("BENCH_EMERGENCY_VENT_VALVES") {
        if let Some(valves) = &overrides.emergency_vent_valves {
            config.emergency_vent_valves = valves.clone();
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub enable_mqtt_listener: bool,
    pub export_batch_size: usize,
    pub export_flush_interval_ms: u64,
    pub export_max_queue: usize,
    pub grpc_socket_path: String,
    pub status_poll_interval_ms: u64,
    pub stale_after_ms: u64,
    pub bucket_resolution_ms: u64,
    pub z_threshold: f64,
    pub warmup_secs: f64,
    pub outlier_method: OutlierMethod,
    pub interlocks: Vec<Interlock>,
    pub emergency_vent_valves: BTreeMap<String, bool>,
    pub summary_feed_url: Option<String>,
    pub summary_feed_token: Option<String>,
    pub summary_feed_batch_size: usize,
    pub summary_feed_flush_ms: u64,
    pub summary_feed_queue: usize,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_pool_size: 4,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic_prefix: "pump".to_string(),
            mqtt_keepalive_secs: 30,
            mqtt_client_id: format!("bench-sidecar-{}", std::process::id()),
            enable_mqtt_listener: true,
            export_batch_size: 16,
            export_flush_interval_ms: 2000,
            export_max_queue: 64,
            grpc_socket_path: "/tmp/bench_control.sock".to_string(),
            status_poll_interval_ms: 500,
            stale_after_ms: 1500,
            bucket_resolution_ms: DEFAULT_BUCKET_RESOLUTION_MS,
            z_threshold: DEFAULT_Z_THRESHOLD,
            warmup_secs: DEFAULT_WARMUP_SECS,
            outlier_method: OutlierMethod::Classical,
            interlocks: Vec::new(),
            emergency_vent_valves: default_vent_pattern(),
            summary_feed_url: None,
            summary_feed_token: None,
            summary_feed_batch_size: 8,
            summary_feed_flush_ms: 1000,
            summary_feed_queue: 32,
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let defaults = Self::default();
        let setup_overrides = load_setup_config_overrides();

        let database_url = env::var("BENCH_DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(normalize_database_url);
        let db_pool_size = env::var("BENCH_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.db_pool_size);

        let mqtt_host = env::var("BENCH_MQTT_HOST").unwrap_or(defaults.mqtt_host);
        let mqtt_port = env::var("BENCH_MQTT_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(defaults.mqtt_port);
        let mqtt_username = env::var("BENCH_MQTT_USERNAME").ok();
        let mqtt_password = env::var("BENCH_MQTT_PASSWORD").ok();
        let mqtt_topic_prefix =
            env::var("BENCH_MQTT_TOPIC_PREFIX").unwrap_or(defaults.mqtt_topic_prefix);
        let mqtt_keepalive_secs = env::var("BENCH_MQTT_KEEPALIVE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.mqtt_keepalive_secs);
        let mqtt_client_id = env::var("BENCH_MQTT_CLIENT_ID").unwrap_or(defaults.mqtt_client_id);
        let enable_mqtt_listener = env::var("BENCH_ENABLE_MQTT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.enable_mqtt_listener);

        let export_batch_size = env::var("BENCH_EXPORT_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.export_batch_size);
        let export_flush_interval_ms = env::var("BENCH_EXPORT_FLUSH_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.export_flush_interval_ms);
        let export_max_queue = env::var("BENCH_EXPORT_MAX_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(export_batch_size.saturating_mul(4));

        let grpc_socket_path = env::var("BENCH_GRPC_SOCKET").unwrap_or(defaults.grpc_socket_path);
        let status_poll_interval_ms = env::var("BENCH_STATUS_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.status_poll_interval_ms);
        let stale_after_ms = env::var("BENCH_STALE_AFTER_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.stale_after_ms);
        let bucket_resolution_ms = env::var("BENCH_BUCKET_RESOLUTION_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(defaults.bucket_resolution_ms);
        let z_threshold = env::var("BENCH_Z_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(defaults.z_threshold);
        let warmup_secs = env::var("BENCH_WARMUP_SECS")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(defaults.warmup_secs);
        let outlier_method = env::var("BENCH_OUTLIER_METHOD")
            .ok()
            .and_then(|v| v.parse::<OutlierMethod>().ok())
            .unwrap_or(defaults.outlier_method);

        let interlocks = match env::var("BENCH_INTERLOCKS") {
            Ok(raw) if !raw.trim().is_empty() => {
                parse_json_env(&raw).context("BENCH_INTERLOCKS is not a valid interlock list")?
            }
            _ => defaults.interlocks,
        };
        let emergency_vent_valves = match env::var("BENCH_EMERGENCY_VENT_VALVES") {
            Ok(raw) if !raw.trim().is_empty() => parse_json_env(&raw)
                .context("BENCH_EMERGENCY_VENT_VALVES is not a valid valve map")?,
            _ => defaults.emergency_vent_valves,
        };

        let summary_feed_url = env::var("BENCH_SUMMARY_FEED_URL").ok();
        let summary_feed_token = env::var("BENCH_SUMMARY_FEED_TOKEN").ok();
        let summary_feed_batch_size = env::var("BENCH_SUMMARY_FEED_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.summary_feed_batch_size);
        let summary_feed_flush_ms = env::var("BENCH_SUMMARY_FEED_FLUSH_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.summary_feed_flush_ms);
        let summary_feed_queue = env::var("BENCH_SUMMARY_FEED_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(summary_feed_batch_size.saturating_mul(4));
        let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        let mut config = Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            enable_mqtt_listener,
            export_batch_size,
            export_flush_interval_ms,
            export_max_queue,
            grpc_socket_path,
            status_poll_interval_ms,
            stale_after_ms,
            bucket_resolution_ms,
            z_threshold,
            warmup_secs,
            outlier_method,
            interlocks,
            emergency_vent_valves,
            summary_feed_url,
            summary_feed_token,
            summary_feed_batch_size,
            summary_feed_flush_ms,
            summary_feed_queue,
            otlp_endpoint,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            let env_allows = |key: &str| {
                std::env::var(key)
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .is_none()
            };
            apply_setup_overrides(&mut config, overrides, env_allows);
        }

        Ok(config)
    }

    pub fn export_flush_interval(&self) -> Duration {
        Duration::from_millis(self.export_flush_interval_ms.max(1))
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms.max(1))
    }

    pub fn summary_feed_flush_interval(&self) -> Duration {
        Duration::from_millis(self.summary_feed_flush_ms.max(1))
    }

    pub fn aggregate_defaults(&self) -> AggregateDefaults {
        AggregateDefaults {
            z_threshold: self.z_threshold,
            warmup_secs: self.warmup_secs,
            method: self.outlier_method,
        }
    }
}

fn parse_json_env<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    let mut bytes = raw.trim().as_bytes().to_vec();
    Ok(simd_json::serde::from_slice(&mut bytes)?)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
