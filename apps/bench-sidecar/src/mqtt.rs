use crate::config::Config;
use crate::dispatch::{CommandGateway, CommandTopics, CommandTransport, Intent, SafetyStatus};
use crate::error::StaleChannelWarning;
use crate::ingest::TelemetryIngestor;
use crate::session::{
    PowerSource, SessionController, SessionEvent, SessionSnapshot, SessionStatus, Summary,
    TestConfig,
};
use crate::telemetry::decode;
use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub prefix: String,
    pub sensors_filter: String,
    pub relay_filter: String,
    pub valves_status: String,
    pub safety_status: String,
    pub control_test: String,
    pub test_status: String,
    pub test_record: String,
    pub system_alert: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            sensors_filter: format!("{prefix}/sensors/#"),
            relay_filter: format!("{prefix}/relay/#"),
            valves_status: format!("{prefix}/valves/status"),
            safety_status: format!("{prefix}/safety/status"),
            control_test: format!("{prefix}/control/test"),
            test_status: format!("{prefix}/test/status"),
            test_record: format!("{prefix}/test/record"),
            system_alert: format!("{prefix}/system/alert"),
        }
    }

    pub fn commands(&self) -> CommandTopics {
        CommandTopics::new(&self.prefix)
    }

    fn subscriptions(&self) -> [&str; 5] {
        [
            self.sensors_filter.as_str(),
            self.relay_filter.as_str(),
            self.valves_status.as_str(),
            self.safety_status.as_str(),
            self.control_test.as_str(),
        ]
    }
}

#[derive(Debug)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(config: &Config) -> Result<(Self, JoinHandle<()>)> {
        let mut options = MqttOptions::new(
            format!("{}-pub", config.mqtt_client_id),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }
        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "mqtt publisher event loop error");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
        Ok((Self { client }, handle))
    }

    pub async fn publish_json(&self, topic: &str, payload: &JsonValue) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await?;
        Ok(())
    }

    /// Queues a disconnect behind any pending publishes; the event loop
    /// task exits once it has been written.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

impl CommandTransport for MqttPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }
}

pub async fn run_listener(
    config: Config,
    ingestor: TelemetryIngestor,
    controller: SessionController,
    gateway: Arc<CommandGateway>,
) -> Result<()> {
    let topics = Topics::new(&config.mqtt_topic_prefix);
    let stats = ingestor.stats();
    'reconnect: loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        for filter in topics.subscriptions() {
            if let Err(err) = client.subscribe(filter, QoS::AtLeastOnce).await {
                tracing::warn!(error=%err, topic=%filter, "failed to subscribe to MQTT; retrying");
                stats.set_mqtt_connected(false);
                sleep(Duration::from_secs(2)).await;
                continue 'reconnect;
            }
        }
        tracing::info!(prefix=%topics.prefix, "subscribed to bench feeds");
        stats.set_mqtt_connected(true);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let received_at = Utc::now();
                    let mut payload = publish.payload.to_vec();

                    if publish.topic == topics.safety_status {
                        match parse_safety_payload(&mut payload) {
                            Some(status) => apply_safety_status(&gateway, &controller, status).await,
                            None => tracing::warn!(topic=%publish.topic, "unreadable safety status"),
                        }
                        continue;
                    }

                    if publish.topic == topics.control_test {
                        match parse_test_command(&mut payload) {
                            Some(command) => handle_test_command(&controller, &gateway, command).await,
                            None => tracing::warn!(topic=%publish.topic, "unreadable test command"),
                        }
                        continue;
                    }

                    match decode(&topics.prefix, &publish.topic, &mut payload) {
                        Ok(Some(readings)) => {
                            for reading in &readings {
                                ingestor.ingest_reading(reading, received_at).await;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(error=%err, topic=%publish.topic, "failed to decode MQTT payload")
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct TestCommand {
    pub(crate) action: String,
    #[serde(default)]
    pub(crate) config: Option<TestConfig>,
}

pub(crate) fn parse_test_command(payload: &mut [u8]) -> Option<TestCommand> {
    if payload.is_empty() {
        return None;
    }
    simd_json::serde::from_slice(payload).ok()
}

pub(crate) fn parse_safety_payload(payload: &mut [u8]) -> Option<SafetyStatus> {
    if payload.is_empty() {
        return None;
    }
    simd_json::serde::from_slice(payload).ok()
}

/// Records a safety report and reacts to the edges it crosses: an engaged
/// emergency stop shuts the bench down and finalizes the running session,
/// an opened cover cuts motor power and pauses the test.
pub(crate) async fn apply_safety_status(
    gateway: &CommandGateway,
    controller: &SessionController,
    status: SafetyStatus,
) {
    let edges = gateway.observe_safety(status);

    if edges.emergency_engaged {
        tracing::error!("emergency stop engaged; shutting the bench down");
        let outcome = gateway.dispatch(Intent::EmergencyShutdown);
        if !outcome.accepted {
            tracing::error!(reason = ?outcome.reason, "emergency shutdown was not published");
        }
        controller.emergency_stop().await;
        return;
    }

    if edges.emergency_released {
        tracing::info!("emergency stop released");
    }

    if edges.cover_opened {
        tracing::warn!("test cover opened; cutting motor power");
        for source in PowerSource::ALL {
            let outcome = gateway.dispatch(Intent::SetPower { source, on: false });
            if !outcome.accepted {
                tracing::warn!(source = source.as_str(), reason = ?outcome.reason, "power cut not published");
            }
        }
        if controller.status().await == SessionStatus::Running {
            if let Err(err) = controller.pause().await {
                tracing::debug!(error=%err, "pause after cover open raced another transition");
            }
        }
    }
}

async fn handle_test_command(
    controller: &SessionController,
    gateway: &CommandGateway,
    command: TestCommand,
) {
    let action = command.action.trim().to_ascii_lowercase();
    let result = match action.as_str() {
        "start" => match command.config {
            Some(config) => match gateway.check_start().into_result() {
                Ok(()) => controller.start(config).await.map(|_| ()),
                Err(err) => Err(err),
            },
            None => {
                tracing::warn!("test start without config ignored");
                return;
            }
        },
        "pause" => controller.pause().await.map(|_| ()),
        "resume" => controller.resume().await.map(|_| ()),
        "stop" => {
            controller.stop().await;
            Ok(())
        }
        "reset" | "abort" => {
            if controller.snapshot().await.is_some() {
                controller.abort().await
            } else {
                Ok(())
            }
        }
        other => {
            tracing::warn!(action = other, "unknown test action");
            return;
        }
    };
    if let Err(err) = result {
        tracing::warn!(error=%err, action=%action, "test command rejected");
    }
}

/// Mirrors session lifecycle events onto the status and record topics.
pub async fn run_event_publisher(
    publisher: Arc<MqttPublisher>,
    topics: Topics,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let (topic, payload) = match &event {
            SessionEvent::Started(snapshot)
            | SessionEvent::Paused(snapshot)
            | SessionEvent::Resumed(snapshot) => (&topics.test_status, status_payload(snapshot)),
            SessionEvent::Aborted { session_id } => (
                &topics.test_status,
                json!({
                    "status": "idle",
                    "session_id": session_id,
                    "aborted": true,
                    "timestamp": Utc::now(),
                }),
            ),
            SessionEvent::Finalized { summary, reason } => {
                let status = json!({
                    "status": "stopped",
                    "session_id": summary.session_id,
                    "test_id": summary.test_id,
                    "passed": summary.passed,
                    "reason": reason.as_str(),
                    "timestamp": summary.ended_at,
                });
                if let Err(err) = publisher.publish_json(&topics.test_status, &status).await {
                    tracing::warn!(error=%err, "failed to publish test status");
                }
                match serde_json::to_value(summary.as_ref()) {
                    Ok(record) => (&topics.test_record, record),
                    Err(err) => {
                        tracing::warn!(error=%err, "failed to encode test record");
                        continue;
                    }
                }
            }
        };
        if let Err(err) = publisher.publish_json(topic, &payload).await {
            tracing::warn!(error=%err, topic=%topic, "failed to publish session event");
        }
    }
}

fn status_payload(snapshot: &SessionSnapshot) -> JsonValue {
    json!({
        "status": snapshot.status,
        "session_id": snapshot.session_id,
        "test_id": snapshot.test_id,
        "pump_model": snapshot.config.pump_model,
        "elapsed_secs": snapshot.elapsed_secs,
        "timestamp": Utc::now(),
    })
}

/// One pass of the periodic task. Duration enforcement runs first and alerts
/// go out through the non-blocking transport, so a saturated or disconnected
/// broker never delays an auto-stop.
pub async fn run_status_tick(
    ingestor: &TelemetryIngestor,
    controller: &SessionController,
    alerts: &dyn CommandTransport,
    alert_topic: &str,
    now: chrono::DateTime<Utc>,
) -> Option<Arc<Summary>> {
    let finalized = controller.enforce_duration(now).await;

    for warning in ingestor.check_stale(now).await {
        let payload = stale_alert_payload(&warning);
        let sent = serde_json::to_vec(&payload)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| alerts.publish(alert_topic, bytes));
        if let Err(err) = sent {
            tracing::warn!(error=%err, channel=%warning.channel, "stale channel alert not published");
        }
    }

    finalized
}

pub fn stale_alert_payload(warning: &StaleChannelWarning) -> JsonValue {
    json!({
        "level": "warning",
        "kind": "stale_channel",
        "channel": warning.channel,
        "silent_for_ms": warning.silent_for_ms,
        "message": warning.to_string(),
        "timestamp": Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::default_vent_pattern;
    use crate::ingest::{Channel, ChannelKind};
    use crate::session::{AggregateDefaults, StopReason, TestMode};
    use crate::state::{self, EngineStats};
    use anyhow::anyhow;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct TestTransport {
        saturated: AtomicBool,
        attempts: AtomicUsize,
        sent: StdMutex<Vec<(String, JsonValue)>>,
    }

    impl TestTransport {
        fn sent(&self) -> Vec<(String, JsonValue)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CommandTransport for TestTransport {
        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            if self.saturated.load(Ordering::Relaxed) {
                return Err(anyhow!("request channel full"));
            }
            let value = serde_json::from_slice(&payload)?;
            self.sent.lock().unwrap().push((topic.to_string(), value));
            Ok(())
        }
    }

    fn bench() -> (TelemetryIngestor, SessionController, CommandGateway, Arc<TestTransport>) {
        let shared = state::shared(std::time::Duration::from_millis(1500));
        let ingestor = TelemetryIngestor::new(shared.clone(), Arc::new(EngineStats::new()), 10);
        let controller = SessionController::new(shared, AggregateDefaults::default());
        let transport = Arc::new(TestTransport::default());
        let gateway = CommandGateway::new(
            transport.clone(),
            CommandTopics::new("pump"),
            Vec::new(),
            default_vent_pattern(),
        );
        (ingestor, controller, gateway, transport)
    }

    fn bench_config(duration_secs: Option<f64>) -> TestConfig {
        TestConfig {
            pump_model: "VP-200".to_string(),
            baselines: BTreeMap::from([("relay1/pressure".to_string(), 15.0)]),
            duration_secs,
            ..TestConfig::default()
        }
    }

    fn status(emergency_stop: bool, cover_closed: bool) -> SafetyStatus {
        SafetyStatus {
            emergency_stop,
            cover_closed,
            system_locked: emergency_stop,
        }
    }

    #[tokio::test]
    async fn status_tick_stops_session_when_alerts_cannot_be_sent() {
        let (ingestor, controller, _gateway, transport) = bench();
        transport.saturated.store(true, Ordering::Relaxed);
        let t0 = Utc::now();
        controller.start_at(bench_config(Some(2.0)), t0).await.unwrap();

        for device in ["relay1", "relay2", "relay3", "relay4"] {
            let channel = Channel::new(device, ChannelKind::Pressure);
            ingestor
                .ingest(channel, 15.0, t0 + ChronoDuration::milliseconds(1200))
                .await;
        }

        let now = t0 + ChronoDuration::seconds(5);
        let summary = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            run_status_tick(&ingestor, &controller, transport.as_ref(), "pump/system/alert", now),
        )
        .await
        .expect("status tick must not wait on the broker")
        .expect("duration elapsed");

        assert_eq!(summary.channels.len(), 4);
        assert_eq!(controller.status().await, SessionStatus::Idle);
        assert_eq!(transport.attempts.load(Ordering::Relaxed), 4);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn status_tick_publishes_new_stale_alerts() {
        let (ingestor, controller, _gateway, transport) = bench();
        let t0 = Utc::now();
        ingestor
            .ingest(Channel::new("main", ChannelKind::Flow), 3.0, t0)
            .await;

        let tick = |secs| {
            run_status_tick(
                &ingestor,
                &controller,
                transport.as_ref(),
                "pump/system/alert",
                t0 + ChronoDuration::seconds(secs),
            )
        };
        assert!(tick(1).await.is_none());
        assert!(tick(2).await.is_none());
        assert!(tick(3).await.is_none());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "pump/system/alert");
        assert_eq!(sent[0].1["channel"], "main/flow");
        assert_eq!(sent[0].1["kind"], "stale_channel");
    }

    #[tokio::test]
    async fn emergency_stop_edge_shuts_down_and_finalizes() {
        let (_ingestor, controller, gateway, transport) = bench();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = controller.with_events(tx);
        apply_safety_status(&gateway, &controller, status(false, true)).await;
        controller.start(bench_config(None)).await.unwrap();
        rx.recv().await.unwrap();

        apply_safety_status(&gateway, &controller, status(true, true)).await;
        assert_eq!(controller.status().await, SessionStatus::Idle);
        match rx.recv().await.unwrap() {
            SessionEvent::Finalized { reason, summary } => {
                assert_eq!(reason, StopReason::EmergencyStop);
                assert!(!summary.passed);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let sent = transport.sent();
        assert_eq!(sent.len(), 5);
        assert!(sent[..4].iter().all(|(topic, payload)| {
            topic == "pump/control/power" && payload["state"] == false
        }));
        assert_eq!(sent[4].1, json!({ "valves": default_vent_pattern() }));
        assert_eq!(gateway.check_start().reason.as_deref(), Some("safety_lockout"));

        // Still pressed: nothing new happens.
        apply_safety_status(&gateway, &controller, status(true, true)).await;
        assert_eq!(transport.sent().len(), 5);
        assert!(controller.last_summary().await.is_some());
    }

    #[tokio::test]
    async fn cover_open_edge_cuts_power_and_pauses() {
        let (_ingestor, controller, gateway, transport) = bench();
        apply_safety_status(&gateway, &controller, status(false, true)).await;
        controller.start(bench_config(None)).await.unwrap();

        apply_safety_status(&gateway, &controller, status(false, false)).await;
        assert_eq!(controller.status().await, SessionStatus::Paused);
        let sent = transport.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent
            .iter()
            .all(|(topic, payload)| topic == "pump/control/power" && payload["state"] == false));

        // Closing the cover again does not resume on its own.
        apply_safety_status(&gateway, &controller, status(false, true)).await;
        assert_eq!(controller.status().await, SessionStatus::Paused);
        assert_eq!(transport.sent().len(), 4);
    }

    #[test]
    fn topics_follow_prefix() {
        let topics = Topics::new("bench");
        assert_eq!(topics.sensors_filter, "bench/sensors/#");
        assert_eq!(topics.control_test, "bench/control/test");
        assert_eq!(topics.commands().valve, "bench/control/valve");
    }

    #[test]
    fn parses_test_command_with_camel_case_config() {
        let mut payload = br#"{
            "action": "start",
            "config": {
                "pumpModel": "VP-200",
                "testMode": "positive",
                "ratedPower": 120,
                "baselines": {"relay1/pressure": 15.0}
            }
        }"#
        .to_vec();
        let command = parse_test_command(&mut payload).unwrap();
        assert_eq!(command.action, "start");
        let config = command.config.unwrap();
        assert_eq!(config.pump_model, "VP-200");
        assert_eq!(config.test_mode, TestMode::Positive);
        assert_eq!(config.rated_power_w, Some(120.0));
        assert_eq!(config.pass_threshold_percent, 50.0);
        assert!(config.retain_samples);
    }

    #[test]
    fn parses_safety_status() {
        let mut payload = br#"{"emergency_stop": false, "cover_closed": true}"#.to_vec();
        let status = parse_safety_payload(&mut payload).unwrap();
        assert!(status.allows_start());

        let mut partial = br#"{"emergency_stop": true}"#.to_vec();
        assert!(!parse_safety_payload(&mut partial).unwrap().allows_start());

        let mut locked =
            br#"{"emergency_stop": false, "cover_closed": true, "system_locked": true}"#.to_vec();
        let status = parse_safety_payload(&mut locked).unwrap();
        assert!(status.system_locked);
        assert!(!status.allows_start());

        assert!(parse_safety_payload(&mut Vec::new()).is_none());
        assert!(parse_safety_payload(&mut b"garbage".to_vec()).is_none());
    }

    #[test]
    fn status_payload_uses_lowercase_status() {
        let snapshot = SessionSnapshot {
            session_id: uuid::Uuid::nil(),
            test_id: None,
            status: SessionStatus::Paused,
            started_at: Utc::now(),
            elapsed_secs: 1.25,
            config: TestConfig::default(),
            channel_counts: Default::default(),
        };
        let payload = status_payload(&snapshot);
        assert_eq!(payload["status"], "paused");
        assert_eq!(payload["elapsed_secs"], 1.25);
    }
}
