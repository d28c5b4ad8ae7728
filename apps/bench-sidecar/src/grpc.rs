use crate::dispatch::{CommandGateway, Intent};
use crate::error::BenchError;
use crate::ingest::{Channel, TelemetryIngestor};
use crate::session::{SessionController, SessionSnapshot, SessionStatus, TestConfig};
use crate::state::EngineStats;
use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;

pub mod proto {
    tonic::include_proto!("pump.bench");
}

use proto::bench_control_server::{BenchControl, BenchControlServer};
use proto::{
    DispatchReply, DispatchRequest, HealthReply, ReadChannelReply, ReadChannelRequest,
    SamplePoint, SessionReply, SessionRequest, StartSessionRequest, StopSessionReply,
};

#[derive(Clone)]
pub struct ControlService {
    ingestor: TelemetryIngestor,
    controller: SessionController,
    gateway: Arc<CommandGateway>,
}

impl ControlService {
    pub fn new(
        ingestor: TelemetryIngestor,
        controller: SessionController,
        gateway: Arc<CommandGateway>,
    ) -> Self {
        Self {
            ingestor,
            controller,
            gateway,
        }
    }

    fn to_health(
        stats: &Arc<EngineStats>,
        session_status: SessionStatus,
        stale_channels: Vec<String>,
    ) -> HealthReply {
        HealthReply {
            samples_appended: stats.samples_appended.load(Ordering::Relaxed),
            samples_overwritten: stats.samples_overwritten.load(Ordering::Relaxed),
            samples_dropped: stats.samples_dropped.load(Ordering::Relaxed),
            mqtt_connected: stats.mqtt_connected.load(Ordering::Relaxed),
            summaries_exported: stats.summaries_exported.load(Ordering::Relaxed),
            export_queue_depth: stats.export_queue_depth.load(Ordering::Relaxed),
            last_export_unix_ms: stats.last_export_unix_ms.load(Ordering::Relaxed) as i64,
            last_error: stats.last_error().unwrap_or_default(),
            session_status: session_status.as_str().to_string(),
            stale_channels,
            build: env!("CARGO_PKG_VERSION").to_string(),
            ..HealthReply::default()
        }
    }
}

fn session_reply(snapshot: Option<SessionSnapshot>) -> SessionReply {
    match snapshot {
        Some(snapshot) => SessionReply {
            session_id: snapshot.session_id.to_string(),
            status: snapshot.status.as_str().to_string(),
            started_at_ms: snapshot.started_at.timestamp_millis(),
            elapsed_secs: snapshot.elapsed_secs,
            channel_counts: snapshot
                .channel_counts
                .into_iter()
                .map(|(channel, count)| (channel, count as u64))
                .collect(),
        },
        None => SessionReply {
            status: SessionStatus::Idle.as_str().to_string(),
            ..SessionReply::default()
        },
    }
}

fn to_status(err: BenchError) -> Status {
    match err {
        BenchError::InvalidConfig(_) => Status::invalid_argument(err.to_string()),
        BenchError::InvalidTransition { .. } => Status::failed_precondition(err.to_string()),
        BenchError::UnsafeCommand { .. } => Status::permission_denied(err.to_string()),
    }
}

#[tonic::async_trait]
impl BenchControl for ControlService {
    async fn start_session(
        &self,
        request: Request<StartSessionRequest>,
    ) -> Result<Response<SessionReply>, Status> {
        let mut raw = request.into_inner().config_json.into_bytes();
        let config: TestConfig = simd_json::serde::from_slice(&mut raw)
            .map_err(|err| Status::invalid_argument(format!("invalid config json: {err}")))?;
        self.gateway
            .check_start()
            .into_result()
            .map_err(to_status)?;
        let snapshot = self.controller.start(config).await.map_err(to_status)?;
        Ok(Response::new(session_reply(Some(snapshot))))
    }

    async fn pause_session(
        &self,
        _request: Request<SessionRequest>,
    ) -> Result<Response<SessionReply>, Status> {
        let snapshot = self.controller.pause().await.map_err(to_status)?;
        Ok(Response::new(session_reply(Some(snapshot))))
    }

    async fn resume_session(
        &self,
        _request: Request<SessionRequest>,
    ) -> Result<Response<SessionReply>, Status> {
        let snapshot = self.controller.resume().await.map_err(to_status)?;
        Ok(Response::new(session_reply(Some(snapshot))))
    }

    async fn stop_session(
        &self,
        _request: Request<SessionRequest>,
    ) -> Result<Response<StopSessionReply>, Status> {
        let Some(summary) = self.controller.stop().await else {
            return Ok(Response::new(StopSessionReply::default()));
        };
        let summary_json = serde_json::to_string(summary.as_ref())
            .map_err(|err| Status::internal(format!("failed to encode summary: {err}")))?;
        Ok(Response::new(StopSessionReply {
            has_summary: true,
            session_id: summary.session_id.to_string(),
            passed: summary.passed,
            summary_json,
        }))
    }

    async fn abort_session(
        &self,
        _request: Request<SessionRequest>,
    ) -> Result<Response<SessionReply>, Status> {
        self.controller.abort().await.map_err(to_status)?;
        Ok(Response::new(session_reply(None)))
    }

    async fn get_session(
        &self,
        _request: Request<SessionRequest>,
    ) -> Result<Response<SessionReply>, Status> {
        Ok(Response::new(session_reply(self.controller.snapshot().await)))
    }

    async fn read_channel(
        &self,
        request: Request<ReadChannelRequest>,
    ) -> Result<Response<ReadChannelReply>, Status> {
        let channel: Channel = request
            .into_inner()
            .channel
            .parse()
            .map_err(Status::invalid_argument)?;
        let samples = self.ingestor.read(&channel).await;
        let now = Utc::now();
        let stale = self
            .ingestor
            .stale_channels(now)
            .await
            .iter()
            .any(|warning| warning.channel == channel);
        let last_seen_ms = self
            .ingestor
            .last_seen(&channel)
            .await
            .map(|ts| ts.timestamp_millis())
            .unwrap_or_default();

        Ok(Response::new(ReadChannelReply {
            channel: channel.to_string(),
            unit: channel.kind.unit().to_string(),
            samples: samples
                .into_iter()
                .map(|sample| SamplePoint {
                    elapsed_secs: sample.elapsed_secs,
                    value: sample.value,
                    received_at_ms: sample.received_at.timestamp_millis(),
                })
                .collect(),
            stale,
            last_seen_ms,
        }))
    }

    async fn dispatch(
        &self,
        request: Request<DispatchRequest>,
    ) -> Result<Response<DispatchReply>, Status> {
        let payload = request.into_inner();
        let mut raw = payload.intent_json.into_bytes();
        let intent: Intent = simd_json::serde::from_slice(&mut raw)
            .map_err(|err| Status::invalid_argument(format!("invalid intent json: {err}")))?;
        let outcome = if payload.operator_override {
            self.gateway.dispatch_with_override(intent)
        } else {
            self.gateway.dispatch(intent)
        };
        Ok(Response::new(DispatchReply {
            accepted: outcome.accepted,
            reason: outcome.reason.unwrap_or_default(),
        }))
    }

    async fn get_health(
        &self,
        _request: Request<SessionRequest>,
    ) -> Result<Response<HealthReply>, Status> {
        let stale_channels = self
            .ingestor
            .stale_channels(Utc::now())
            .await
            .into_iter()
            .map(|warning| warning.channel.to_string())
            .collect();
        let status = self.controller.status().await;
        let mut reply = Self::to_health(&self.ingestor.stats(), status, stale_channels);

        reply.relay_states = self.gateway.relay_states().into_iter().collect();
        reply.powered_sources = self
            .gateway
            .power_states()
            .into_iter()
            .filter(|(_, on)| *on)
            .map(|(source, _)| source.as_str().to_string())
            .collect();
        if let Some(safety) = self.gateway.safety() {
            reply.safety_known = true;
            reply.emergency_stop = safety.emergency_stop;
            reply.cover_closed = safety.cover_closed;
        }
        reply.channels = self
            .ingestor
            .channels()
            .await
            .iter()
            .map(ToString::to_string)
            .collect();
        reply.bucket_resolution_ms = self.ingestor.bucket_resolution_ms();
        if let Some(summary) = self.controller.last_summary().await {
            reply.last_summary_session_id = summary.session_id.to_string();
            reply.last_summary_passed = summary.passed;
        }
        Ok(Response::new(reply))
    }
}

pub async fn serve_uds(socket_path: &str, service: ControlService) -> Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }

    let uds = UnixListener::bind(socket_path)?;
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<BenchControlServer<ControlService>>()
        .await;

    let incoming = UnixListenerStream::new(uds);

    Server::builder()
        .add_service(health_service)
        .add_service(BenchControlServer::new(service))
        .serve_with_incoming(incoming)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{default_vent_pattern, CommandTopics, CommandTransport, Interlock};
    use crate::session::AggregateDefaults;
    use crate::state;
    use tokio::time::Duration;

    struct NullTransport;

    impl CommandTransport for NullTransport {
        fn publish(&self, _topic: &str, _payload: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn service() -> ControlService {
        let shared = state::shared(Duration::from_millis(1500));
        let ingestor =
            TelemetryIngestor::new(shared.clone(), Arc::new(EngineStats::new()), 10);
        let controller = SessionController::new(shared, AggregateDefaults::default());
        let gateway = Arc::new(CommandGateway::new(
            Arc::new(NullTransport),
            CommandTopics::new("pump"),
            vec![Interlock {
                name: "vent_while_pumping".to_string(),
                states: default_vent_pattern(),
            }],
            default_vent_pattern(),
        ));
        ControlService::new(ingestor, controller, gateway)
    }

    #[tokio::test]
    async fn session_round_trip_over_rpc() {
        let service = service();
        let reply = service
            .start_session(Request::new(StartSessionRequest {
                config_json: r#"{"pump_model":"VP-200","baselines":{"main/flow":3.0}}"#
                    .to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status, "running");

        let err = service
            .resume_session(Request::new(SessionRequest {}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        let stop = service
            .stop_session(Request::new(SessionRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(stop.has_summary);
        assert!(!stop.passed);
        assert_eq!(stop.session_id, reply.session_id);

        let idle = service
            .get_session(Request::new(SessionRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(idle.status, "idle");
    }

    #[tokio::test]
    async fn rejects_bad_inputs() {
        let service = service();
        let err = service
            .start_session(Request::new(StartSessionRequest {
                config_json: r#"{"pump_model":"VP-200"}"#.to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = service
            .read_channel(Request::new(ReadChannelRequest {
                channel: "nonsense".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn start_refused_under_safety_lockout() {
        let service = service();
        service.gateway.observe_safety(crate::dispatch::SafetyStatus {
            emergency_stop: true,
            cover_closed: true,
            system_locked: false,
        });
        let err = service
            .start_session(Request::new(StartSessionRequest {
                config_json: r#"{"pump_model":"VP-200","baselines":{"main/flow":3.0}}"#
                    .to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);

        let health = service
            .get_health(Request::new(SessionRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(health.session_status, "idle");
        assert!(health.safety_known);
        assert!(health.emergency_stop);
        assert_eq!(health.bucket_resolution_ms, 10);
        assert!(health.last_summary_session_id.is_empty());
    }

    #[tokio::test]
    async fn dispatch_reports_interlock_rejection() {
        let service = service();
        let reply = service
            .dispatch(Request::new(DispatchRequest {
                intent_json: r#"{"intent":"set_valves","states":{"A":true,"B":true,"C":false,"D":false}}"#
                    .to_string(),
                operator_override: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!reply.accepted);
        assert_eq!(reply.reason, "unsafe_combination");
    }
}
