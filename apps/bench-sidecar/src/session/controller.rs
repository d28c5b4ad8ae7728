use super::types::{
    elapsed_secs, ChannelSummary, Session, SessionEvent, SessionSnapshot, SessionStatus,
    StopReason, Summary, TestConfig,
};
use crate::error::BenchError;
use crate::ingest::{Channel, ChannelBuffer};
use crate::pipeline::PipelineHandle;
use crate::state::{EngineState, SharedState};
use crate::stats::{
    self, AggregateParams, OutlierMethod, DEFAULT_WARMUP_SECS, DEFAULT_Z_THRESHOLD,
};
use crate::summary_feed::SummaryFeed;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Aggregation settings used when a session config does not override them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateDefaults {
    pub z_threshold: f64,
    pub warmup_secs: f64,
    pub method: OutlierMethod,
}

impl Default for AggregateDefaults {
    fn default() -> Self {
        Self {
            z_threshold: DEFAULT_Z_THRESHOLD,
            warmup_secs: DEFAULT_WARMUP_SECS,
            method: OutlierMethod::Classical,
        }
    }
}

#[derive(Clone)]
pub struct SessionController {
    state: SharedState,
    defaults: AggregateDefaults,
    pipeline: Option<PipelineHandle>,
    summary_feed: Option<SummaryFeed>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionController {
    pub(crate) fn new(state: SharedState, defaults: AggregateDefaults) -> Self {
        Self {
            state,
            defaults,
            pipeline: None,
            summary_feed: None,
            events: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: Option<PipelineHandle>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_summary_feed(mut self, summary_feed: Option<SummaryFeed>) -> Self {
        self.summary_feed = summary_feed;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn start(&self, config: TestConfig) -> Result<SessionSnapshot, BenchError> {
        self.start_at(config, Utc::now()).await
    }

    pub async fn start_at(
        &self,
        config: TestConfig,
        now: DateTime<Utc>,
    ) -> Result<SessionSnapshot, BenchError> {
        let baselines = config.validate()?;
        let snapshot = {
            let mut state = self.state.lock().await;
            if let Some(existing) = &state.session {
                return Err(BenchError::InvalidTransition {
                    action: "start",
                    status: existing.status.as_str(),
                });
            }
            let session = Session::new(config, baselines, now);
            let snapshot = session.snapshot(now);
            state.session = Some(session);
            snapshot
        };

        tracing::info!(
            session_id = %snapshot.session_id,
            pump_model = %snapshot.config.pump_model,
            channels = snapshot.config.baselines.len(),
            "test session started"
        );
        self.emit(SessionEvent::Started(snapshot.clone()));
        Ok(snapshot)
    }

    pub async fn pause(&self) -> Result<SessionSnapshot, BenchError> {
        let snapshot = self
            .transition("pause", SessionStatus::Running, SessionStatus::Paused)
            .await?;
        tracing::info!(session_id = %snapshot.session_id, "test session paused");
        self.emit(SessionEvent::Paused(snapshot.clone()));
        Ok(snapshot)
    }

    pub async fn resume(&self) -> Result<SessionSnapshot, BenchError> {
        let snapshot = self
            .transition("resume", SessionStatus::Paused, SessionStatus::Running)
            .await?;
        tracing::info!(session_id = %snapshot.session_id, "test session resumed");
        self.emit(SessionEvent::Resumed(snapshot.clone()));
        Ok(snapshot)
    }

    async fn transition(
        &self,
        action: &'static str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<SessionSnapshot, BenchError> {
        let mut state = self.state.lock().await;
        let Some(session) = state.session.as_mut() else {
            return Err(BenchError::InvalidTransition {
                action,
                status: SessionStatus::Idle.as_str(),
            });
        };
        if session.status != from {
            return Err(BenchError::InvalidTransition {
                action,
                status: session.status.as_str(),
            });
        }
        session.status = to;
        Ok(session.snapshot(Utc::now()))
    }

    /// Finalizes the active session. When idle, returns the most recent
    /// summary without recomputing it.
    pub async fn stop(&self) -> Option<Arc<Summary>> {
        self.stop_at(Utc::now()).await
    }

    pub async fn stop_at(&self, now: DateTime<Utc>) -> Option<Arc<Summary>> {
        let finalized = {
            let mut state = self.state.lock().await;
            if state.session.is_none() {
                return state.last_summary.clone();
            }
            finalize_locked(&mut state, now, &self.defaults)
        };
        if let Some(summary) = &finalized {
            self.publish_summary(summary.clone(), StopReason::Operator);
        }
        finalized
    }

    /// Finalizes the session once its configured duration has elapsed.
    pub async fn enforce_duration(&self, now: DateTime<Utc>) -> Option<Arc<Summary>> {
        let finalized = {
            let mut state = self.state.lock().await;
            let due = state.session.as_ref().is_some_and(|session| {
                session
                    .config
                    .duration_secs
                    .is_some_and(|limit| elapsed_secs(session.started_at, now) >= limit)
            });
            if !due {
                return None;
            }
            finalize_locked(&mut state, now, &self.defaults)
        };
        if let Some(summary) = &finalized {
            self.publish_summary(summary.clone(), StopReason::DurationElapsed);
        }
        finalized
    }

    /// Finalizes an active session after the emergency stop engaged.
    /// Unlike `stop`, returns None when no session was running.
    pub async fn emergency_stop(&self) -> Option<Arc<Summary>> {
        let finalized = {
            let mut state = self.state.lock().await;
            finalize_locked(&mut state, Utc::now(), &self.defaults)
        };
        if let Some(summary) = &finalized {
            tracing::error!(session_id = %summary.session_id, "test session cut short by emergency stop");
            self.publish_summary(summary.clone(), StopReason::EmergencyStop);
        }
        finalized
    }

    /// Discards the active session without producing a summary.
    pub async fn abort(&self) -> Result<(), BenchError> {
        let session = {
            let mut state = self.state.lock().await;
            state.session.take().ok_or(BenchError::InvalidTransition {
                action: "abort",
                status: SessionStatus::Idle.as_str(),
            })?
        };
        tracing::warn!(session_id = %session.id, "test session aborted; samples discarded");
        self.emit(SessionEvent::Aborted {
            session_id: session.id,
        });
        Ok(())
    }

    pub async fn status(&self) -> SessionStatus {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.status)
            .unwrap_or(SessionStatus::Idle)
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let state = self.state.lock().await;
        state
            .session
            .as_ref()
            .map(|session| session.snapshot(Utc::now()))
    }

    pub async fn last_summary(&self) -> Option<Arc<Summary>> {
        self.state.lock().await.last_summary.clone()
    }

    fn publish_summary(&self, summary: Arc<Summary>, reason: StopReason) {
        tracing::info!(
            session_id = %summary.session_id,
            passed = summary.passed,
            duration_secs = summary.duration_secs,
            reason = reason.as_str(),
            "test session finalized"
        );
        if let Some(pipeline) = &self.pipeline {
            if let Err(err) = pipeline.enqueue(summary.clone()) {
                tracing::warn!(error = %err, session_id = %summary.session_id, "failed to queue summary export");
            }
        }
        if let Some(feed) = &self.summary_feed {
            feed.enqueue(summary.clone());
        }
        self.emit(SessionEvent::Finalized { summary, reason });
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                tracing::debug!("session event receiver closed");
            }
        }
    }
}

/// Takes the session out of the shared state and turns it into a summary.
/// Samples racing the lock find no running session and are dropped.
fn finalize_locked(
    state: &mut EngineState,
    now: DateTime<Utc>,
    defaults: &AggregateDefaults,
) -> Option<Arc<Summary>> {
    let mut session = state.session.take()?;
    session.status = SessionStatus::Stopped;
    let summary = Arc::new(finalize(session, now, defaults));
    state.last_summary = Some(summary.clone());
    Some(summary)
}

pub(crate) fn finalize(session: Session, ended_at: DateTime<Utc>, defaults: &AggregateDefaults) -> Summary {
    let Session {
        id,
        started_at,
        config,
        baselines,
        mut buffers,
        ..
    } = session;

    let z_threshold = config.z_threshold.unwrap_or(defaults.z_threshold);
    let min_elapsed = config.warmup_secs.unwrap_or(defaults.warmup_secs);

    let mut channels: Vec<Channel> = buffers
        .keys()
        .chain(baselines.keys())
        .cloned()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    channels.sort();

    let mut summaries = BTreeMap::new();
    let mut needs_replacement = false;
    for channel in channels {
        let samples = buffers
            .remove(&channel)
            .map(ChannelBuffer::into_samples)
            .unwrap_or_default();
        let baseline = baselines.get(&channel).copied();
        let channel_stats = match (baseline, defaults.method) {
            (Some(baseline), OutlierMethod::Classical) => {
                stats::summarize(&samples, baseline, z_threshold, min_elapsed)
            }
            _ => stats::summarize_with(
                &samples,
                &AggregateParams {
                    baseline,
                    z_threshold,
                    min_elapsed,
                    method: defaults.method,
                },
            ),
        };
        let channel_needs_replacement = baseline.is_some()
            && stats::needs_replacement(&channel_stats, config.pass_threshold_percent);
        if channel_needs_replacement {
            tracing::warn!(
                channel = %channel,
                mean = channel_stats.mean,
                baseline_percentage = ?channel_stats.baseline_percentage,
                "channel below pass threshold"
            );
        }
        needs_replacement |= channel_needs_replacement;

        summaries.insert(
            channel.to_string(),
            ChannelSummary {
                channel,
                sample_count: samples.len(),
                baseline,
                stats: channel_stats,
                needs_replacement: channel_needs_replacement,
                samples: config.retain_samples.then_some(samples),
            },
        );
    }

    Summary {
        session_id: id,
        test_id: config.test_id.clone(),
        started_at,
        ended_at,
        duration_secs: elapsed_secs(started_at, ended_at),
        channels: summaries,
        needs_replacement,
        passed: !needs_replacement,
        config,
    }
}
