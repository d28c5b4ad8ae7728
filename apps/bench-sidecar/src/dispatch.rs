//! Safety-checked actuator commands.
//!
//! Every command goes through one gateway that knows the last accepted
//! relay and power states. A command whose resulting state matches a
//! configured interlock is refused before anything reaches the broker.

use crate::error::BenchError;
use crate::session::{PowerSource, TestConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

pub const REASON_UNSAFE_COMBINATION: &str = "unsafe_combination";
pub const REASON_SAFETY_LOCKOUT: &str = "safety_lockout";
pub const REASON_TRANSPORT_ERROR: &str = "transport_error";

/// Sends an encoded command. Implementations must not block.
pub trait CommandTransport: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    SetRelay { relay: String, energized: bool },
    SetValves { states: BTreeMap<String, bool> },
    SetPower { source: PowerSource, on: bool },
    SetConfig { key: String, value: serde_json::Value },
    StartTest { config: TestConfig },
    StopTest,
    PauseTest,
    ResumeTest,
    EmergencyShutdown,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::SetRelay { .. } => "set_relay",
            Intent::SetValves { .. } => "set_valves",
            Intent::SetPower { .. } => "set_power",
            Intent::SetConfig { .. } => "set_config",
            Intent::StartTest { .. } => "start_test",
            Intent::StopTest => "stop_test",
            Intent::PauseTest => "pause_test",
            Intent::ResumeTest => "resume_test",
            Intent::EmergencyShutdown => "emergency_shutdown",
        }
    }

    /// True for commands that drive hardware toward an active state.
    fn energizes(&self) -> bool {
        match self {
            Intent::SetRelay { energized, .. } => *energized,
            Intent::SetValves { states } => states.values().any(|on| *on),
            Intent::SetPower { on, .. } => *on,
            Intent::StartTest { .. } | Intent::ResumeTest => true,
            _ => false,
        }
    }
}

/// A relay combination that must never be commanded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interlock {
    pub name: String,
    pub states: BTreeMap<String, bool>,
}

impl Interlock {
    /// Relays absent from `relays` count as de-energized.
    pub fn matches(&self, relays: &BTreeMap<String, bool>) -> bool {
        !self.states.is_empty()
            && self
                .states
                .iter()
                .all(|(relay, want)| relays.get(relay).copied().unwrap_or(false) == *want)
    }
}

impl fmt::Display for Interlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.name)?;
        for (idx, (relay, on)) in self.states.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{relay}={}", if *on { "on" } else { "off" })?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyStatus {
    pub emergency_stop: bool,
    pub cover_closed: bool,
    /// Set by the safety monitor after an emergency stop until it is reset.
    pub system_locked: bool,
}

impl SafetyStatus {
    pub fn allows_start(&self) -> bool {
        !self.emergency_stop && self.cover_closed && !self.system_locked
    }
}

/// Safety changes since the previous report that need an immediate response.
/// An unknown previous state counts as safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SafetyEdges {
    pub emergency_engaged: bool,
    pub emergency_released: bool,
    pub cover_opened: bool,
}

impl SafetyEdges {
    fn between(previous: Option<SafetyStatus>, current: SafetyStatus) -> Self {
        let was_engaged = previous.is_some_and(|prev| prev.emergency_stop);
        let was_closed = previous.map_or(true, |prev| prev.cover_closed);
        Self {
            emergency_engaged: current.emergency_stop && !was_engaged,
            emergency_released: !current.emergency_stop && was_engaged,
            cover_opened: !current.cover_closed && was_closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl DispatchOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }

    pub fn into_result(self) -> Result<(), BenchError> {
        if self.accepted {
            Ok(())
        } else {
            Err(BenchError::UnsafeCommand {
                reason: self.reason.unwrap_or_else(|| "rejected".to_string()),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopics {
    pub valve: String,
    pub power: String,
    pub test: String,
    pub config: String,
}

impl CommandTopics {
    pub fn new(prefix: &str) -> Self {
        Self {
            valve: format!("{prefix}/control/valve"),
            power: format!("{prefix}/control/power"),
            test: format!("{prefix}/control/test"),
            config: format!("{prefix}/control/config"),
        }
    }
}

#[derive(Debug, Default)]
struct GatewayState {
    relays: BTreeMap<String, bool>,
    power: BTreeMap<PowerSource, bool>,
    /// None until the safety monitor has reported at least once.
    safety: Option<SafetyStatus>,
}

pub struct CommandGateway {
    transport: Arc<dyn CommandTransport>,
    topics: CommandTopics,
    interlocks: Vec<Interlock>,
    vent_pattern: BTreeMap<String, bool>,
    state: Mutex<GatewayState>,
}

impl CommandGateway {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        topics: CommandTopics,
        interlocks: Vec<Interlock>,
        vent_pattern: BTreeMap<String, bool>,
    ) -> Self {
        Self {
            transport,
            topics,
            interlocks,
            vent_pattern,
            state: Mutex::new(GatewayState::default()),
        }
    }

    pub fn interlocks(&self) -> &[Interlock] {
        &self.interlocks
    }

    pub fn relay_states(&self) -> BTreeMap<String, bool> {
        self.lock_state().relays.clone()
    }

    pub fn power_states(&self) -> BTreeMap<PowerSource, bool> {
        self.lock_state().power.clone()
    }

    pub fn safety(&self) -> Option<SafetyStatus> {
        self.lock_state().safety
    }

    /// Records the latest safety report and returns the edges it crossed.
    pub fn observe_safety(&self, status: SafetyStatus) -> SafetyEdges {
        let mut state = self.lock_state();
        if state.safety != Some(status) {
            tracing::info!(
                emergency_stop = status.emergency_stop,
                cover_closed = status.cover_closed,
                system_locked = status.system_locked,
                "safety status changed"
            );
        }
        let edges = SafetyEdges::between(state.safety, status);
        state.safety = Some(status);
        edges
    }

    pub fn dispatch(&self, intent: Intent) -> DispatchOutcome {
        self.dispatch_inner(intent, false)
    }

    /// Safety gate for a session start that does not publish anything itself.
    pub fn check_start(&self) -> DispatchOutcome {
        match self.lock_state().safety {
            Some(safety) if !safety.allows_start() => {
                tracing::warn!(
                    emergency_stop = safety.emergency_stop,
                    cover_closed = safety.cover_closed,
                    "test start refused by safety lockout"
                );
                DispatchOutcome::rejected(REASON_SAFETY_LOCKOUT)
            }
            _ => DispatchOutcome::accepted(),
        }
    }

    /// Skips interlock evaluation. The safety lockout still applies.
    pub fn dispatch_with_override(&self, intent: Intent) -> DispatchOutcome {
        tracing::warn!(intent = intent.name(), "dispatching with operator override");
        self.dispatch_inner(intent, true)
    }

    fn dispatch_inner(&self, intent: Intent, operator_override: bool) -> DispatchOutcome {
        let mut state = self.lock_state();

        if intent.energizes() {
            if let Some(safety) = state.safety.filter(|safety| !safety.allows_start()) {
                tracing::warn!(
                    intent = intent.name(),
                    emergency_stop = safety.emergency_stop,
                    cover_closed = safety.cover_closed,
                    "command refused by safety lockout"
                );
                return DispatchOutcome::rejected(REASON_SAFETY_LOCKOUT);
            }
        }

        match intent {
            Intent::SetRelay { relay, energized } => {
                let mut next = state.relays.clone();
                next.insert(relay.clone(), energized);
                self.apply_relays(
                    &mut state,
                    next,
                    json!({ "valve": relay, "state": energized }),
                    operator_override,
                )
            }
            Intent::SetValves { states } => {
                let mut next = state.relays.clone();
                next.extend(states.iter().map(|(relay, on)| (relay.clone(), *on)));
                self.apply_relays(
                    &mut state,
                    next,
                    json!({ "valves": states }),
                    operator_override,
                )
            }
            Intent::SetPower { source, on } => {
                let payload = json!({ "power_type": source.as_str(), "state": on });
                match self.send(&self.topics.power, &payload) {
                    Ok(()) => {
                        state.power.insert(source, on);
                        DispatchOutcome::accepted()
                    }
                    Err(outcome) => outcome,
                }
            }
            Intent::SetConfig { key, value } => {
                let payload = json!({ "key": key, "value": value });
                self.send(&self.topics.config, &payload)
                    .map_or_else(|outcome| outcome, |()| DispatchOutcome::accepted())
            }
            Intent::StartTest { config } => {
                let payload = json!({ "action": "start", "config": config });
                self.send(&self.topics.test, &payload)
                    .map_or_else(|outcome| outcome, |()| DispatchOutcome::accepted())
            }
            Intent::StopTest | Intent::PauseTest | Intent::ResumeTest => {
                let action = match intent {
                    Intent::StopTest => "stop",
                    Intent::PauseTest => "pause",
                    _ => "resume",
                };
                self.send(&self.topics.test, &json!({ "action": action }))
                    .map_or_else(|outcome| outcome, |()| DispatchOutcome::accepted())
            }
            Intent::EmergencyShutdown => self.emergency_shutdown(&mut state),
        }
    }

    fn apply_relays(
        &self,
        state: &mut GatewayState,
        next: BTreeMap<String, bool>,
        payload: serde_json::Value,
        operator_override: bool,
    ) -> DispatchOutcome {
        if let Some(interlock) = self.interlocks.iter().find(|lock| lock.matches(&next)) {
            if operator_override {
                tracing::warn!(interlock = %interlock, "interlock bypassed by operator override");
            } else {
                tracing::warn!(interlock = %interlock, "command refused by interlock");
                return DispatchOutcome::rejected(REASON_UNSAFE_COMBINATION);
            }
        }
        match self.send(&self.topics.valve, &payload) {
            Ok(()) => {
                state.relays = next;
                DispatchOutcome::accepted()
            }
            Err(outcome) => outcome,
        }
    }

    /// All power off, then the vent valve pattern. Never subject to
    /// interlocks or the safety lockout.
    fn emergency_shutdown(&self, state: &mut GatewayState) -> DispatchOutcome {
        tracing::warn!("emergency shutdown requested");
        let mut failed = false;
        for source in PowerSource::ALL {
            let payload = json!({ "power_type": source.as_str(), "state": false });
            match self.send(&self.topics.power, &payload) {
                Ok(()) => {
                    state.power.insert(source, false);
                }
                Err(_) => failed = true,
            }
        }
        if !self.vent_pattern.is_empty() {
            let payload = json!({ "valves": self.vent_pattern });
            match self.send(&self.topics.valve, &payload) {
                Ok(()) => state
                    .relays
                    .extend(self.vent_pattern.iter().map(|(relay, on)| (relay.clone(), *on))),
                Err(_) => failed = true,
            }
        }
        if failed {
            DispatchOutcome::rejected(REASON_TRANSPORT_ERROR)
        } else {
            DispatchOutcome::accepted()
        }
    }

    fn send(&self, topic: &str, payload: &serde_json::Value) -> Result<(), DispatchOutcome> {
        let bytes = serde_json::to_vec(payload).map_err(|err| {
            tracing::warn!(error = %err, topic, "failed to encode command");
            DispatchOutcome::rejected(REASON_TRANSPORT_ERROR)
        })?;
        self.transport.publish(topic, bytes).map_err(|err| {
            tracing::warn!(error = %err, topic, "failed to publish command");
            DispatchOutcome::rejected(REASON_TRANSPORT_ERROR)
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GatewayState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Vents the manifold: A and B open, C and D closed.
pub fn default_vent_pattern() -> BTreeMap<String, bool> {
    BTreeMap::from([
        ("A".to_string(), true),
        ("B".to_string(), true),
        ("C".to_string(), false),
        ("D".to_string(), false),
    ])
}
