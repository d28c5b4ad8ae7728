use super::buffer::{bucket_of, ChannelBuffer};
use super::types::{Channel, DropReason, IngestOutcome, Sample};
use super::TelemetryIngestor;
use crate::error::StaleChannelWarning;
use crate::session::SessionStatus;
use crate::state::{EngineStats, SharedState};
use crate::telemetry::Reading;
use chrono::{DateTime, Utc};
use std::sync::Arc;

impl TelemetryIngestor {
    pub(crate) fn new(
        state: SharedState,
        stats: Arc<EngineStats>,
        bucket_resolution_ms: u64,
    ) -> Self {
        Self {
            state,
            stats,
            bucket_resolution_ms: bucket_resolution_ms.max(1),
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    pub fn bucket_resolution_ms(&self) -> u64 {
        self.bucket_resolution_ms
    }

    /// Records one measurement against the running session, if any.
    ///
    /// Liveness is refreshed for every arrival, including dropped ones.
    pub async fn ingest(
        &self,
        channel: Channel,
        value: f64,
        arrival: DateTime<Utc>,
    ) -> IngestOutcome {
        let outcome = {
            let mut state = self.state.lock().await;
            if state.liveness.touch(&channel, arrival) {
                tracing::info!(channel = %channel, "channel reporting again");
            }
            self.append(&mut state.session, channel.clone(), value, arrival)
        };

        if let IngestOutcome::Dropped(reason) = outcome {
            tracing::trace!(channel = %channel, reason = reason.as_str(), "sample dropped");
        }
        self.stats.record_outcome(outcome);
        outcome
    }

    fn append(
        &self,
        session: &mut Option<crate::session::Session>,
        channel: Channel,
        value: f64,
        arrival: DateTime<Utc>,
    ) -> IngestOutcome {
        let Some(session) = session
            .as_mut()
            .filter(|session| session.status == SessionStatus::Running)
        else {
            return IngestOutcome::Dropped(DropReason::NoRunningSession);
        };
        if !value.is_finite() {
            return IngestOutcome::Dropped(DropReason::NonFiniteValue);
        }

        let elapsed_micros = (arrival - session.started_at)
            .num_microseconds()
            .unwrap_or(i64::MAX);
        if elapsed_micros < 0 {
            return IngestOutcome::Dropped(DropReason::BeforeSessionStart);
        }

        let bucket = bucket_of(elapsed_micros, self.bucket_resolution_ms);
        let sample = Sample {
            channel: channel.clone(),
            elapsed_secs: elapsed_micros as f64 / 1_000_000.0,
            value,
            received_at: arrival,
        };
        session
            .buffers
            .entry(channel)
            .or_insert_with(ChannelBuffer::new)
            .insert(bucket, sample)
    }

    /// Feeds every scalar of a decoded reading, stamped with the local
    /// arrival time.
    pub async fn ingest_reading(
        &self,
        reading: &Reading,
        arrival: DateTime<Utc>,
    ) -> Vec<(Channel, IngestOutcome)> {
        let mut outcomes = Vec::with_capacity(reading.measurements.len());
        for (channel, value) in reading.scalars() {
            let outcome = self.ingest(channel.clone(), value, arrival).await;
            outcomes.push((channel, outcome));
        }
        outcomes
    }

    /// Samples of the running (or paused) session for one channel, in
    /// elapsed-time order. Empty when no session is active.
    pub async fn read(&self, channel: &Channel) -> Vec<Sample> {
        let state = self.state.lock().await;
        state
            .session
            .as_ref()
            .and_then(|session| session.buffers.get(channel))
            .map(ChannelBuffer::snapshot)
            .unwrap_or_default()
    }

    pub async fn channels(&self) -> Vec<Channel> {
        let state = self.state.lock().await;
        let mut channels: Vec<Channel> = state
            .session
            .as_ref()
            .map(|session| session.buffers.keys().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    pub async fn last_seen(&self, channel: &Channel) -> Option<DateTime<Utc>> {
        self.state.lock().await.liveness.last_seen(channel)
    }

    /// Emits a warning for each channel that went silent since the last
    /// check. Ingestion is never blocked by staleness.
    pub async fn check_stale(&self, now: DateTime<Utc>) -> Vec<StaleChannelWarning> {
        let warnings = self.state.lock().await.liveness.check(now);
        for warning in &warnings {
            tracing::warn!(
                channel = %warning.channel,
                silent_for_ms = warning.silent_for_ms,
                "channel went stale"
            );
        }
        warnings
    }

    pub async fn stale_channels(&self, now: DateTime<Utc>) -> Vec<StaleChannelWarning> {
        self.state.lock().await.liveness.stale_channels(now)
    }
}
