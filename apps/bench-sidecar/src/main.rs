mod config;
mod dispatch;
mod error;
mod grpc;
mod ingest;
mod mqtt;
mod pipeline;
mod session;
mod state;
mod stats;
mod summary_feed;
mod telemetry;

use crate::config::Config;
use crate::dispatch::CommandGateway;
use crate::grpc::{serve_uds, ControlService};
use crate::ingest::TelemetryIngestor;
use crate::mqtt::{MqttPublisher, Topics};
use crate::pipeline::{build_pool, ensure_schema, spawn_worker, ExportCommand, PipelineHandle};
use crate::session::{SessionController, SessionEvent};
use crate::state::EngineStats;
use crate::summary_feed::SummaryFeed;
use anyhow::Result;
use chrono::Utc;
use futures::future;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(5);

async fn within_shutdown_timeout<F: Future>(step: &'static str, fut: F) -> Option<F::Output> {
    match timeout(SHUTDOWN_STEP_TIMEOUT, fut).await {
        Ok(output) => Some(output),
        Err(_) => {
            tracing::warn!(step, "shutdown step timed out");
            None
        }
    }
}

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,bench_sidecar=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "bench-sidecar"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let stats = Arc::new(EngineStats::new());
    let shared = state::shared(config.stale_after());

    let pipeline = match &config.database_url {
        Some(database_url) => {
            let pool = build_pool(database_url, config.db_pool_size).await?;
            ensure_schema(&pool).await?;
            let (tx, rx) = mpsc::channel::<ExportCommand>(config.export_max_queue);
            spawn_worker(
                pool,
                rx,
                stats.clone(),
                config.export_batch_size,
                config.export_flush_interval(),
            );
            Some(PipelineHandle::new(tx, stats.clone()))
        }
        None => {
            tracing::info!("no database configured; summaries will not be persisted");
            None
        }
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let ingestor = TelemetryIngestor::new(shared.clone(), stats.clone(), config.bucket_resolution_ms);
    let summary_feed = SummaryFeed::new(&config);
    let controller = SessionController::new(shared, config.aggregate_defaults())
        .with_pipeline(pipeline.clone())
        .with_summary_feed(summary_feed.clone())
        .with_events(event_tx);

    let topics = Topics::new(&config.mqtt_topic_prefix);
    let (publisher, publisher_loop) = MqttPublisher::new(&config)?;
    let publisher = Arc::new(publisher);
    let gateway = Arc::new(CommandGateway::new(
        publisher.clone(),
        topics.commands(),
        config.interlocks.clone(),
        config.emergency_vent_valves.clone(),
    ));
    tracing::info!(
        interlocks = gateway.interlocks().len(),
        "command gateway ready"
    );

    let events_handle = tokio::spawn(mqtt::run_event_publisher(
        publisher.clone(),
        topics.clone(),
        event_rx,
    ));

    let grpc_service = ControlService::new(ingestor.clone(), controller.clone(), gateway.clone());
    let grpc_path = config.grpc_socket_path.clone();
    let mut grpc_handle = tokio::spawn(async move { serve_uds(&grpc_path, grpc_service).await });

    let mut mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let ingestor_clone = ingestor.clone();
        let controller_clone = controller.clone();
        let gateway_clone = gateway.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, ingestor_clone, controller_clone, gateway_clone).await
        }))
    } else {
        None
    };

    let status_handle = {
        let controller = controller.clone();
        let publisher = publisher.clone();
        let alert_topic = topics.system_alert.clone();
        let poll_interval = config.status_poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                mqtt::run_status_tick(
                    &ingestor,
                    &controller,
                    publisher.as_ref(),
                    &alert_topic,
                    Utc::now(),
                )
                .await;
            }
        })
    };

    let mut grpc_done = false;
    let mut mqtt_done = false;
    tokio::select! {
        res = &mut grpc_handle => {
            grpc_done = true;
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "gRPC server exited"),
                Err(err) => tracing::error!(error=%err, "gRPC task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = async {
            if let Some(handle) = mqtt_handle.as_mut() {
                if let Err(err) = handle.await { tracing::warn!(error=%err, "MQTT task failed"); }
            } else {
                future::pending::<()>().await;
            }
        } => {
            mqtt_done = true;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    status_handle.abort();
    let _ = status_handle.await;
    if controller.snapshot().await.is_some() {
        if let Some(summary) = controller.stop().await {
            tracing::info!(session_id=%summary.session_id, "finalized active session on shutdown");
        }
    }
    if let Some(pipeline) = &pipeline {
        if let Some(Err(err)) = within_shutdown_timeout("pipeline flush", pipeline.flush()).await {
            tracing::warn!(error=%err, "failed to flush summary exports on shutdown");
        }
    }
    if let Some(feed) = &summary_feed {
        within_shutdown_timeout("summary feed flush", feed.flush()).await;
    }

    // Every controller clone holds an event sender; the event publisher
    // drains and exits once the last one is gone.
    if !grpc_done {
        grpc_handle.abort();
        let _ = grpc_handle.await;
    }
    if let Some(handle) = mqtt_handle.filter(|_| !mqtt_done) {
        handle.abort();
        let _ = handle.await;
    }
    drop(controller);
    within_shutdown_timeout("session event drain", events_handle).await;

    if let Some(Err(err)) = within_shutdown_timeout("MQTT disconnect", publisher.disconnect()).await {
        tracing::warn!(error=%err, "MQTT publisher disconnect failed");
    }
    within_shutdown_timeout("MQTT publisher drain", publisher_loop).await;

    Ok(())
}
