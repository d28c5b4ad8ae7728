use crate::session::Summary;
use crate::state::EngineStats;
use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::types::Json as SqlJson;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum ExportCommand {
    Summary(Arc<Summary>),
    Flush(oneshot::Sender<()>),
}

/// Queues finalized summaries for the Postgres export worker.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<ExportCommand>,
    stats: Arc<EngineStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<ExportCommand>, stats: Arc<EngineStats>) -> Self {
        Self { tx, stats }
    }

    /// Never waits: a full queue is reported as an error.
    pub fn enqueue(&self, summary: Arc<Summary>) -> Result<()> {
        let queue_depth = self.stats.export_queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, session_id = %summary.session_id, "queued summary export");
        if let Err(err) = self.tx.try_send(ExportCommand::Summary(summary)) {
            self.stats.export_queue_depth.fetch_sub(1, Ordering::Relaxed);
            self.stats.record_error(format!("summary export queue: {err}"));
            return Err(anyhow!("summary export queue unavailable: {err}"));
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(ExportCommand::Flush(tx)).await;
        let _ = rx.await;
        Ok(())
    }
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bench_summaries (
            session_id uuid primary key,
            test_id text null,
            pump_model text not null,
            started_at timestamptz not null,
            ended_at timestamptz not null,
            duration_secs double precision not null,
            passed boolean not null,
            needs_replacement boolean not null,
            summary jsonb not null,
            inserted_at timestamptz not null default now()
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub fn spawn_worker(
    pool: PgPool,
    mut rx: mpsc::Receiver<ExportCommand>,
    stats: Arc<EngineStats>,
    batch_size: usize,
    flush_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let batch_size = batch_size.max(1);
        let mut buffer: Vec<Arc<Summary>> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = flush(&pool, &mut buffer, &stats).await {
                        tracing::warn!(error=%err, "summary export on interval failed");
                    }
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(ExportCommand::Summary(summary)) => {
                            stats.export_queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(summary);
                            if buffer.len() >= batch_size {
                                if let Err(err) = flush(&pool, &mut buffer, &stats).await {
                                    tracing::warn!(error=%err, "summary export on batch size failed");
                                }
                            }
                        }
                        Some(ExportCommand::Flush(done)) => {
                            if let Err(err) = flush(&pool, &mut buffer, &stats).await {
                                tracing::warn!(error=%err, "summary export on demand failed");
                            }
                            let _ = done.send(());
                        }
                        None => {
                            if let Err(err) = flush(&pool, &mut buffer, &stats).await {
                                tracing::warn!(error=%err, "summary export during shutdown failed");
                            }
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn flush(pool: &PgPool, buffer: &mut Vec<Arc<Summary>>, stats: &Arc<EngineStats>) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    let items = std::mem::take(buffer);
    let len = items.len();

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO bench_summaries (session_id, test_id, pump_model, started_at, ended_at, \
         duration_secs, passed, needs_replacement, summary) ",
    );
    builder.push_values(items.iter(), |mut b, summary| {
        b.push_bind(summary.session_id)
            .push_bind(summary.test_id.as_deref())
            .push_bind(summary.config.pump_model.as_str())
            .push_bind(summary.started_at)
            .push_bind(summary.ended_at)
            .push_bind(summary.duration_secs)
            .push_bind(summary.passed)
            .push_bind(summary.needs_replacement)
            .push_bind(SqlJson(summary.as_ref()));
    });
    builder.push(" ON CONFLICT (session_id) DO NOTHING");

    let result = builder.build().execute(pool).await;
    match result {
        Ok(result) => {
            let inserted = result.rows_affected() as usize;
            if inserted < len {
                tracing::warn!(
                    inserted,
                    skipped = len.saturating_sub(inserted),
                    "skipped already exported summaries"
                );
            }
            stats
                .summaries_exported
                .fetch_add(inserted as u64, Ordering::Relaxed);
            let now = Utc::now().timestamp_millis() as u64;
            stats.last_export_unix_ms.store(now, Ordering::Relaxed);
            stats.clear_error();
            tracing::debug!(len, micros = started.elapsed().as_micros() as u64, "exported summaries");
        }
        Err(err) => {
            stats.record_error(err.to_string());
            tracing::error!(error=%err, "failed to export summaries");
            buffer.extend(items);
            return Err(err.into());
        }
    }

    Ok(())
}
