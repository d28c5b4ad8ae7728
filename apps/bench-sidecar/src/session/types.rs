use crate::error::BenchError;
use crate::ingest::{Channel, ChannelBuffer, Sample};
use crate::stats::{ChannelStats, DEFAULT_PASS_THRESHOLD_PERCENT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    #[default]
    Vacuum,
    Positive,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    #[default]
    Pressure,
    Flow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSource {
    Dc,
    Ac110,
    Ac220,
    #[serde(rename = "ac220_3p")]
    Ac220ThreePhase,
}

impl PowerSource {
    pub const ALL: [PowerSource; 4] = [
        PowerSource::Dc,
        PowerSource::Ac110,
        PowerSource::Ac220,
        PowerSource::Ac220ThreePhase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerSource::Dc => "dc",
            PowerSource::Ac110 => "ac110",
            PowerSource::Ac220 => "ac220",
            PowerSource::Ac220ThreePhase => "ac220_3p",
        }
    }
}

/// Operator-supplied parameters for one test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default, alias = "pumpModel")]
    pub pump_model: String,
    #[serde(default, alias = "testId")]
    pub test_id: Option<String>,
    #[serde(default, alias = "testMode")]
    pub test_mode: TestMode,
    #[serde(default, alias = "testType")]
    pub test_type: TestType,
    #[serde(default, alias = "powerSource")]
    pub power_source: Option<PowerSource>,
    #[serde(default, alias = "ratedPower")]
    pub rated_power_w: Option<f64>,
    #[serde(default, alias = "maxCurrent")]
    pub max_current_a: Option<f64>,
    /// Expected healthy mean per channel, keyed `<device>/<kind>`.
    #[serde(default)]
    pub baselines: BTreeMap<String, f64>,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold_percent: f64,
    #[serde(default)]
    pub z_threshold: Option<f64>,
    #[serde(default)]
    pub warmup_secs: Option<f64>,
    /// Auto-stop after this many seconds of wall-clock time.
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default = "default_true")]
    pub retain_samples: bool,
}

fn default_pass_threshold() -> f64 {
    DEFAULT_PASS_THRESHOLD_PERCENT
}

fn default_true() -> bool {
    true
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            pump_model: String::new(),
            test_id: None,
            test_mode: TestMode::default(),
            test_type: TestType::default(),
            power_source: None,
            rated_power_w: None,
            max_current_a: None,
            baselines: BTreeMap::new(),
            pass_threshold_percent: DEFAULT_PASS_THRESHOLD_PERCENT,
            z_threshold: None,
            warmup_secs: None,
            duration_secs: None,
            retain_samples: true,
        }
    }
}

impl TestConfig {
    /// Checks the config and returns the baselines keyed by parsed channel.
    pub fn validate(&self) -> Result<HashMap<Channel, f64>, BenchError> {
        if self.pump_model.trim().is_empty() {
            return Err(BenchError::invalid_config("pump_model is required"));
        }
        if self.baselines.is_empty() {
            return Err(BenchError::invalid_config(
                "at least one channel baseline is required",
            ));
        }
        if !self.pass_threshold_percent.is_finite() || self.pass_threshold_percent < 0.0 {
            return Err(BenchError::invalid_config(
                "pass_threshold_percent must be a non-negative number",
            ));
        }
        if let Some(z) = self.z_threshold {
            if !z.is_finite() || z <= 0.0 {
                return Err(BenchError::invalid_config("z_threshold must be positive"));
            }
        }
        if let Some(warmup) = self.warmup_secs {
            if !warmup.is_finite() || warmup < 0.0 {
                return Err(BenchError::invalid_config(
                    "warmup_secs must be zero or more",
                ));
            }
        }
        if let Some(duration) = self.duration_secs {
            if !duration.is_finite() || duration <= 0.0 {
                return Err(BenchError::invalid_config("duration_secs must be positive"));
            }
        }

        let mut baselines = HashMap::with_capacity(self.baselines.len());
        for (raw, baseline) in &self.baselines {
            let channel: Channel = raw.parse().map_err(BenchError::InvalidConfig)?;
            if !baseline.is_finite() || *baseline == 0.0 {
                return Err(BenchError::invalid_config(format!(
                    "baseline for {channel} must be finite and non-zero"
                )));
            }
            baselines.insert(channel, *baseline);
        }
        Ok(baselines)
    }
}

#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) id: Uuid,
    pub(crate) status: SessionStatus,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) config: TestConfig,
    pub(crate) baselines: HashMap<Channel, f64>,
    pub(crate) buffers: HashMap<Channel, ChannelBuffer>,
}

impl Session {
    pub(crate) fn new(
        config: TestConfig,
        baselines: HashMap<Channel, f64>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Running,
            started_at,
            config,
            baselines,
            buffers: HashMap::new(),
        }
    }

    pub(crate) fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            test_id: self.config.test_id.clone(),
            status: self.status,
            started_at: self.started_at,
            elapsed_secs: elapsed_secs(self.started_at, now),
            config: self.config.clone(),
            channel_counts: self
                .buffers
                .iter()
                .map(|(channel, buffer)| (channel.to_string(), buffer.len()))
                .collect(),
        }
    }
}

pub(crate) fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from)
        .num_microseconds()
        .map(|micros| micros as f64 / 1_000_000.0)
        .unwrap_or(f64::MAX)
        .max(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub test_id: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub config: TestConfig,
    pub channel_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel: Channel,
    pub sample_count: usize,
    pub baseline: Option<f64>,
    pub stats: ChannelStats,
    pub needs_replacement: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<Vec<Sample>>,
}

/// The immutable record of one finalized session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub session_id: Uuid,
    pub test_id: Option<String>,
    pub config: TestConfig,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub channels: BTreeMap<String, ChannelSummary>,
    pub needs_replacement: bool,
    pub passed: bool,
}

impl Summary {
    pub fn channel(&self, channel: &Channel) -> Option<&ChannelSummary> {
        self.channels.get(&channel.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Operator,
    DurationElapsed,
    EmergencyStop,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Operator => "operator",
            StopReason::DurationElapsed => "duration_elapsed",
            StopReason::EmergencyStop => "emergency_stop",
        }
    }
}

/// Lifecycle notifications for whoever publishes session progress.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started(SessionSnapshot),
    Paused(SessionSnapshot),
    Resumed(SessionSnapshot),
    Finalized {
        summary: std::sync::Arc<Summary>,
        reason: StopReason,
    },
    Aborted {
        session_id: Uuid,
    },
}
