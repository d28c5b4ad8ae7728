use crate::config::Config;
use crate::session::Summary;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, MissedTickBehavior};

pub const TOKEN_HEADER: &str = "X-Bench-Summary-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

enum FeedCommand {
    Summary(Arc<Summary>),
    Flush(oneshot::Sender<()>),
}

/// Forwards finalized summaries to an HTTP collector in batches.
#[derive(Clone)]
pub struct SummaryFeed {
    tx: mpsc::Sender<FeedCommand>,
}

#[derive(Serialize)]
struct SummaryFeedPayload<'a> {
    summaries: Vec<&'a Summary>,
}

impl SummaryFeed {
    pub fn new(config: &Config) -> Option<Self> {
        let url = config.summary_feed_url.clone()?;
        let (tx, rx) = mpsc::channel(config.summary_feed_queue.max(1));
        let token = config.summary_feed_token.clone();
        let batch_size = config.summary_feed_batch_size.max(1);
        let flush_interval = config.summary_feed_flush_interval();

        tokio::spawn(async move {
            run_summary_feed(rx, url, token, batch_size, flush_interval).await;
        });

        Some(Self { tx })
    }

    pub fn enqueue(&self, summary: Arc<Summary>) {
        if let Err(err) = self.tx.try_send(FeedCommand::Summary(summary)) {
            tracing::warn!(error=%err, "summary feed queue full; dropping summary");
        }
    }

    /// Sends whatever is buffered now. A failed send is logged, not retried.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(FeedCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_summary_feed(
    mut rx: mpsc::Receiver<FeedCommand>,
    url: String,
    token: Option<String>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let client = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buffer: Vec<Arc<Summary>> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = flush_summary_feed(&client, &url, token.as_deref(), &mut buffer, batch_size).await {
                    tracing::warn!(error=%err, "summary feed flush failed");
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(FeedCommand::Summary(summary)) => {
                        buffer.push(summary);
                        if buffer.len() >= batch_size {
                            if let Err(err) = flush_summary_feed(&client, &url, token.as_deref(), &mut buffer, batch_size).await {
                                tracing::warn!(error=%err, "summary feed flush failed");
                            }
                        }
                    }
                    Some(FeedCommand::Flush(done)) => {
                        if let Err(err) = flush_summary_feed(&client, &url, token.as_deref(), &mut buffer, batch_size).await {
                            tracing::warn!(error=%err, "summary feed flush on demand failed");
                        }
                        let _ = done.send(());
                    }
                    None => {
                        let _ = flush_summary_feed(&client, &url, token.as_deref(), &mut buffer, batch_size).await;
                        break;
                    }
                }
            }
        }
    }
}

/// On a failed send the batch is kept for the next tick, up to a few
/// batches' worth; older summaries are dropped beyond that.
async fn flush_summary_feed(
    client: &Client,
    url: &str,
    token: Option<&str>,
    buffer: &mut Vec<Arc<Summary>>,
    batch_size: usize,
) -> Result<(), reqwest::Error> {
    if buffer.is_empty() {
        return Ok(());
    }

    let payload = SummaryFeedPayload {
        summaries: buffer.iter().map(|summary| summary.as_ref()).collect(),
    };
    let mut request = client.post(url).json(&payload);
    if let Some(token) = token {
        request = request.header(TOKEN_HEADER, token);
    }

    match request.send().await {
        Ok(response) => {
            if !response.status().is_success() {
                tracing::warn!(status=%response.status(), "summary feed returned non-success");
            }
            buffer.clear();
            Ok(())
        }
        Err(err) => {
            let keep = batch_size.saturating_mul(4);
            if buffer.len() > keep {
                let dropped = buffer.len() - keep;
                buffer.drain(..dropped);
                tracing::warn!(dropped, "summary feed backlog trimmed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AggregateDefaults, SessionController, TestConfig};
    use crate::state;

    fn feed_config(url: Option<&str>) -> Config {
        Config {
            summary_feed_url: url.map(str::to_string),
            summary_feed_flush_ms: 60_000,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn disabled_without_url() {
        assert!(SummaryFeed::new(&feed_config(None)).is_none());
    }

    #[tokio::test]
    async fn flush_returns_when_collector_is_unreachable() {
        let feed = SummaryFeed::new(&feed_config(Some("http://127.0.0.1:9/feed")))
            .expect("feed enabled");
        let controller = SessionController::new(
            state::shared(std::time::Duration::from_millis(1500)),
            AggregateDefaults::default(),
        )
        .with_summary_feed(Some(feed.clone()));

        controller
            .start(TestConfig {
                pump_model: "VP-200".to_string(),
                baselines: [("relay1/pressure".to_string(), 15.0)].into(),
                ..TestConfig::default()
            })
            .await
            .unwrap();
        assert!(controller.stop().await.is_some());

        tokio::time::timeout(Duration::from_secs(15), feed.flush())
            .await
            .expect("flush completes after the failed send");
    }
}
