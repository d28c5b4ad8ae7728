use crate::ingest::{Channel, ChannelKind};
use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use simd_json::prelude::ValueAsScalar;
use simd_json::BorrowedValue;

pub const DEFAULT_DEVICE: &str = "main";

/// One decoded physical quantity, already in canonical units.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Pressure { kpa: f64 },
    Flow { lpm: f64 },
    Voltage { volts: f64 },
    Current { amps: f64 },
    Power { watts: f64 },
    RelayState { energized: bool },
}

impl Measurement {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Measurement::Pressure { .. } => ChannelKind::Pressure,
            Measurement::Flow { .. } => ChannelKind::Flow,
            Measurement::Voltage { .. } => ChannelKind::Voltage,
            Measurement::Current { .. } => ChannelKind::Current,
            Measurement::Power { .. } => ChannelKind::Power,
            Measurement::RelayState { .. } => ChannelKind::RelayState,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Measurement::Pressure { kpa } => *kpa,
            Measurement::Flow { lpm } => *lpm,
            Measurement::Voltage { volts } => *volts,
            Measurement::Current { amps } => *amps,
            Measurement::Power { watts } => *watts,
            Measurement::RelayState { energized } => {
                if *energized {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Everything one MQTT message said about one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device: String,
    pub measurements: Vec<Measurement>,
    /// Device-side timestamp, informational only. Ingestion stamps the
    /// local arrival time.
    pub captured_at: Option<DateTime<Utc>>,
}

impl Reading {
    pub fn scalars(&self) -> Vec<(Channel, f64)> {
        self.measurements
            .iter()
            .map(|measurement| {
                (
                    Channel::new(self.device.clone(), measurement.kind()),
                    measurement.value(),
                )
            })
            .collect()
    }
}

/// Decodes a sensor topic into readings. `Ok(None)` means the topic is not
/// a sensor feed; `Err` means it is one but the payload is unusable.
///
/// Recognised topics, relative to the prefix:
/// `sensors/{pressure,flow,current,voltage}[/<device>]`,
/// `sensors/power/<device>`, `relay/<relay>/<kind>` and `valves/status`.
pub fn decode(topic_prefix: &str, topic: &str, payload: &mut [u8]) -> Result<Option<Vec<Reading>>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < 2 || parts[0] != topic_prefix {
        return Ok(None);
    }

    match &parts[1..] {
        ["sensors", "power", device] => {
            let value = parse_payload(payload)?;
            let measurements = power_measurements(&value);
            if measurements.is_empty() {
                return Err(anyhow!("power payload on {topic} carries no readings"));
            }
            Ok(Some(vec![Reading {
                device: device.to_string(),
                measurements,
                captured_at: captured_at(&value),
            }]))
        }
        ["sensors", kind] => decode_single(topic, kind, DEFAULT_DEVICE, payload),
        ["sensors", kind, device] => decode_single(topic, kind, device, payload),
        ["relay", relay, kind] => decode_single(topic, kind, relay, payload),
        ["valves", "status"] => {
            let value = parse_payload(payload)?;
            let captured = captured_at(&value);
            let BorrowedValue::Object(obj) = &value else {
                return Err(anyhow!("valve status on {topic} is not an object"));
            };
            let mut readings: Vec<Reading> = obj
                .iter()
                .filter_map(|(valve, state)| {
                    if valve == "timestamp" {
                        return None;
                    }
                    let energized = switch_state(state)?;
                    Some(Reading {
                        device: valve.to_string(),
                        measurements: vec![Measurement::RelayState { energized }],
                        captured_at: captured,
                    })
                })
                .collect();
            readings.sort_by(|a, b| a.device.cmp(&b.device));
            Ok(Some(readings))
        }
        _ => Ok(None),
    }
}

fn decode_single(
    topic: &str,
    kind: &str,
    device: &str,
    payload: &mut [u8],
) -> Result<Option<Vec<Reading>>> {
    let Ok(kind) = kind.parse::<ChannelKind>() else {
        return Ok(None);
    };
    if kind == ChannelKind::Power {
        // sensors/power/<device> is handled separately; a bare power topic
        // carries a single active-power figure.
        let value = parse_payload(payload)?;
        let watts = field(&value, &["value", "active_power", "power"])
            .ok_or_else(|| anyhow!("payload on {topic} carries no power value"))?;
        return Ok(Some(vec![Reading {
            device: device.to_string(),
            measurements: vec![Measurement::Power { watts }],
            captured_at: captured_at(&value),
        }]));
    }

    let value = parse_payload(payload)?;
    let measurement = match kind {
        ChannelKind::Pressure => field(&value, &["value", "pressure_kpa", "pressure"])
            .or_else(|| field(&value, &["pressure_mpa"]).map(|mpa| mpa * 1000.0))
            .map(|kpa| Measurement::Pressure { kpa }),
        ChannelKind::Flow => field(&value, &["value", "flow_instantaneous", "flow"])
            .map(|lpm| Measurement::Flow { lpm }),
        ChannelKind::Voltage => {
            field(&value, &["value", "voltage"]).map(|volts| Measurement::Voltage { volts })
        }
        ChannelKind::Current => {
            field(&value, &["value", "current"]).map(|amps| Measurement::Current { amps })
        }
        ChannelKind::RelayState => lookup(&value, &["value", "state"])
            .and_then(switch_state)
            .map(|energized| Measurement::RelayState { energized }),
        ChannelKind::Power => None,
    }
    .ok_or_else(|| anyhow!("payload on {topic} carries no {kind} value"))?;

    Ok(Some(vec![Reading {
        device: device.to_string(),
        measurements: vec![measurement],
        captured_at: captured_at(&value),
    }]))
}

fn parse_payload(payload: &mut [u8]) -> Result<BorrowedValue<'_>> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(anyhow!("empty payload"));
    }
    Ok(simd_json::to_borrowed_value(payload)?)
}

fn power_measurements(value: &BorrowedValue<'_>) -> Vec<Measurement> {
    let mut measurements = Vec::new();
    if let Some(volts) = field(value, &["voltage"]) {
        measurements.push(Measurement::Voltage { volts });
    }
    if let Some(amps) = field(value, &["current"]) {
        measurements.push(Measurement::Current { amps });
    }
    if let Some(watts) = field(value, &["active_power", "total_power", "power"]) {
        measurements.push(Measurement::Power { watts });
    }
    measurements
}

/// A bare scalar payload counts as `value`.
fn lookup<'v, 'a>(value: &'v BorrowedValue<'a>, keys: &[&str]) -> Option<&'v BorrowedValue<'a>> {
    match value {
        BorrowedValue::Object(obj) => keys.iter().find_map(|key| obj.get(*key)),
        BorrowedValue::Static(_) if keys.contains(&"value") => Some(value),
        _ => None,
    }
}

fn field(value: &BorrowedValue<'_>, keys: &[&str]) -> Option<f64> {
    match value {
        BorrowedValue::Object(obj) => keys.iter().find_map(|key| obj.get(*key).and_then(number)),
        other if keys.contains(&"value") => number(other),
        _ => None,
    }
}

fn number(value: &BorrowedValue<'_>) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .or_else(|| value.as_u64().map(|v| v as f64))
        .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
}

fn switch_state(value: &BorrowedValue<'_>) -> Option<bool> {
    if let Some(flag) = value.as_bool() {
        return Some(flag);
    }
    if let Some(raw) = value.as_str() {
        return match raw.trim().to_ascii_uppercase().as_str() {
            "ON" | "TRUE" | "1" => Some(true),
            "OFF" | "FALSE" | "0" => Some(false),
            _ => None,
        };
    }
    number(value).map(|n| n != 0.0)
}

fn captured_at(value: &BorrowedValue<'_>) -> Option<DateTime<Utc>> {
    let BorrowedValue::Object(obj) = value else {
        return None;
    };
    let raw = obj.get("timestamp")?;
    if let Some(text) = raw.as_str() {
        return DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }
    if let Some(ms) = raw.as_i64().or_else(|| raw.as_u64().map(|v| v as i64)) {
        return millis_to_dt(ms);
    }
    raw.as_f64().and_then(|secs| millis_to_dt((secs * 1000.0) as i64))
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
