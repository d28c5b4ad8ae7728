use super::{Channel, ChannelKind, DropReason, IngestOutcome, TelemetryIngestor};
use crate::session::{AggregateDefaults, SessionController, TestConfig};
use crate::state::{self, EngineStats};
use crate::telemetry::decode;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::Duration;

fn engine() -> (TelemetryIngestor, SessionController) {
    let shared = state::shared(Duration::from_millis(1500));
    let ingestor = TelemetryIngestor::new(shared.clone(), Arc::new(EngineStats::new()), 10);
    let controller = SessionController::new(shared, AggregateDefaults::default());
    (ingestor, controller)
}

async fn running(controller: &SessionController) -> DateTime<Utc> {
    let t0 = Utc::now();
    controller
        .start_at(
            TestConfig {
                pump_model: "VP-200".to_string(),
                baselines: BTreeMap::from([("main/flow".to_string(), 3.0)]),
                ..TestConfig::default()
            },
            t0,
        )
        .await
        .unwrap();
    t0
}

fn flow() -> Channel {
    Channel::new("main", ChannelKind::Flow)
}

#[tokio::test]
async fn idle_ingest_is_a_no_op() {
    let (ingestor, _) = engine();
    let outcome = ingestor.ingest(flow(), 3.0, Utc::now()).await;
    assert_eq!(outcome, IngestOutcome::Dropped(DropReason::NoRunningSession));
    assert!(ingestor.read(&flow()).await.is_empty());
    assert!(ingestor.channels().await.is_empty());
    assert_eq!(ingestor.stats().samples_dropped.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn samples_read_back_in_elapsed_order() {
    let (ingestor, controller) = engine();
    let t0 = running(&controller).await;

    for ms in [300i64, 100, 500, 200, 400] {
        let outcome = ingestor
            .ingest(flow(), ms as f64, t0 + ChronoDuration::milliseconds(ms))
            .await;
        assert_eq!(outcome, IngestOutcome::Appended);
    }

    let samples = ingestor.read(&flow()).await;
    let elapsed: Vec<f64> = samples.iter().map(|s| s.elapsed_secs).collect();
    assert_eq!(elapsed, vec![0.1, 0.2, 0.3, 0.4, 0.5]);
    assert!(samples.iter().all(|s| s.channel == flow()));
}

#[tokio::test]
async fn same_bucket_keeps_latest_value() {
    let (ingestor, controller) = engine();
    let t0 = running(&controller).await;

    ingestor
        .ingest(flow(), 1.0, t0 + ChronoDuration::milliseconds(1000))
        .await;
    let outcome = ingestor
        .ingest(flow(), 2.0, t0 + ChronoDuration::milliseconds(1003))
        .await;
    assert_eq!(outcome, IngestOutcome::Overwritten);

    let samples = ingestor.read(&flow()).await;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value, 2.0);
    assert_eq!(
        ingestor.stats().samples_overwritten.load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn rejects_non_finite_and_early_samples() {
    let (ingestor, controller) = engine();
    let t0 = running(&controller).await;

    assert_eq!(
        ingestor.ingest(flow(), f64::NAN, t0).await,
        IngestOutcome::Dropped(DropReason::NonFiniteValue)
    );
    assert_eq!(
        ingestor
            .ingest(flow(), 3.0, t0 - ChronoDuration::milliseconds(50))
            .await,
        IngestOutcome::Dropped(DropReason::BeforeSessionStart)
    );
    assert!(ingestor.read(&flow()).await.is_empty());
}

#[tokio::test]
async fn decoded_power_reading_lands_on_three_channels() {
    let (ingestor, controller) = engine();
    let t0 = running(&controller).await;

    let mut payload = br#"{"voltage": 220.4, "current": 1.8, "active_power": 396.7}"#.to_vec();
    let readings = decode("pump", "pump/sensors/power/ac220", &mut payload)
        .unwrap()
        .unwrap();
    let outcomes = ingestor
        .ingest_reading(&readings[0], t0 + ChronoDuration::milliseconds(1200))
        .await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|(_, outcome)| outcome.stored()));

    let channels: Vec<String> = ingestor
        .channels()
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(
        channels,
        vec!["ac220/voltage", "ac220/current", "ac220/power"]
    );
}

#[tokio::test]
async fn liveness_tracks_arrivals_without_a_session() {
    let (ingestor, _) = engine();
    let t0 = Utc::now();
    let current = Channel::new("dc", ChannelKind::Current);

    ingestor.ingest(current.clone(), 1.0, t0).await;
    assert_eq!(ingestor.last_seen(&current).await, Some(t0));
    assert!(ingestor
        .check_stale(t0 + ChronoDuration::milliseconds(1000))
        .await
        .is_empty());

    let warnings = ingestor
        .check_stale(t0 + ChronoDuration::milliseconds(2000))
        .await;
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].channel, current);

    // Warned once; still listed as stale until it reports again.
    assert!(ingestor
        .check_stale(t0 + ChronoDuration::milliseconds(2500))
        .await
        .is_empty());
    assert_eq!(
        ingestor
            .stale_channels(t0 + ChronoDuration::milliseconds(2500))
            .await
            .len(),
        1
    );

    ingestor
        .ingest(current.clone(), 1.1, t0 + ChronoDuration::milliseconds(2600))
        .await;
    assert!(ingestor
        .stale_channels(t0 + ChronoDuration::milliseconds(2700))
        .await
        .is_empty());
}
