use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Pressure,
    Flow,
    Voltage,
    Current,
    Power,
    RelayState,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Pressure => "pressure",
            ChannelKind::Flow => "flow",
            ChannelKind::Voltage => "voltage",
            ChannelKind::Current => "current",
            ChannelKind::Power => "power",
            ChannelKind::RelayState => "relay_state",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            ChannelKind::Pressure => "kPa",
            ChannelKind::Flow => "L/min",
            ChannelKind::Voltage => "V",
            ChannelKind::Current => "A",
            ChannelKind::Power => "W",
            ChannelKind::RelayState => "",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pressure" => Ok(ChannelKind::Pressure),
            "flow" => Ok(ChannelKind::Flow),
            "voltage" => Ok(ChannelKind::Voltage),
            "current" => Ok(ChannelKind::Current),
            "power" => Ok(ChannelKind::Power),
            "relay_state" | "relay" | "state" => Ok(ChannelKind::RelayState),
            other => Err(format!("unknown measurement kind '{other}'")),
        }
    }
}

/// A named scalar source: one device (or relay) and one measurement kind.
///
/// Rendered and parsed as `<device>/<kind>`, e.g. `relay1/pressure`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Channel {
    pub device: String,
    pub kind: ChannelKind,
}

impl Channel {
    pub fn new(device: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            device: device.into(),
            kind,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.kind)
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (device, kind) = raw
            .trim()
            .rsplit_once('/')
            .ok_or_else(|| format!("channel '{raw}' is not of the form <device>/<kind>"))?;
        let device = device.trim();
        if device.is_empty() {
            return Err(format!("channel '{raw}' has an empty device"));
        }
        Ok(Channel::new(device, kind.parse()?))
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

impl TryFrom<String> for Channel {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub channel: Channel,
    pub elapsed_secs: f64,
    pub value: f64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoRunningSession,
    BeforeSessionStart,
    NonFiniteValue,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NoRunningSession => "no_running_session",
            DropReason::BeforeSessionStart => "before_session_start",
            DropReason::NonFiniteValue => "non_finite_value",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Appended,
    Overwritten,
    Dropped(DropReason),
}

impl IngestOutcome {
    pub fn stored(&self) -> bool {
        !matches!(self, IngestOutcome::Dropped(_))
    }
}
