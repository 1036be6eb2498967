use super::Output;
use crate::types::{RunSummary, TimeSeriesPoint};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use lapin::{options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Publishes progress points to `<queue>.metrics` while the run is live and
/// the final summary to `<queue>` at the end.
pub struct AmqpOutput {
    url: String,
    queue: String,
    metrics_queue: String,
    session: Mutex<Option<Session>>,
}

struct Session {
    connection: Connection,
    channel: Channel,
    run_id: Uuid,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressMessage<'a> {
    run_id: Uuid,
    published_at: String,
    #[serde(flatten)]
    point: &'a TimeSeriesPoint,
}

impl AmqpOutput {
    pub fn new(url: &str, queue: &str) -> Self {
        Self {
            url: url.to_string(),
            queue: queue.to_string(),
            metrics_queue: format!("{}.metrics", queue),
            session: Mutex::new(None),
        }
    }

    async fn publish(channel: &Channel, queue: &str, payload: &[u8]) -> anyhow::Result<()> {
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await?
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Output for AmqpOutput {
    fn description(&self) -> String {
        format!("amqp ({})", self.queue)
    }

    async fn start(&self, run_id: Uuid) -> anyhow::Result<()> {
        info!("📡 Connecting to RabbitMQ at {}", self.url);
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .with_context(|| format!("failed to connect to {}", self.url))?;
        let channel = connection.create_channel().await?;

        for queue in [&self.queue, &self.metrics_queue] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        info!("✅ Connected to RabbitMQ, publishing to {}", self.queue);

        *self.session.lock().await = Some(Session {
            connection,
            channel,
            run_id,
        });
        Ok(())
    }

    async fn publish_progress(&self, point: &TimeSeriesPoint) -> anyhow::Result<()> {
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Ok(());
        };
        let message = ProgressMessage {
            run_id: session.run_id,
            published_at: Utc::now().to_rfc3339(),
            point,
        };
        let payload = serde_json::to_vec(&message)?;
        Self::publish(&session.channel, &self.metrics_queue, &payload).await
    }

    async fn finish(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let session = self
            .session
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("not connected to {}", self.url))?;
        let payload = serde_json::to_vec(summary)?;
        Self::publish(&session.channel, &self.queue, &payload).await?;
        info!("📤 Test result sent to queue {}", self.queue);

        if let Err(e) = session.connection.close(200, "run finished").await {
            warn!("⚠️ Failed to close RabbitMQ connection: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_before_start_is_skipped() {
        let output = AmqpOutput::new("amqp://localhost:5672", "results");
        assert_eq!(output.metrics_queue, "results.metrics");
        assert!(output.publish_progress(&TimeSeriesPoint {
            timestamp: 0,
            elapsed_secs: 0.0,
            vus: 0,
            target_vus: 0,
            iterations: 0,
            iterations_per_second: 0.0,
            avg_iteration_duration: 0.0,
            p95_iteration_duration: 0.0,
            error_rate: 0.0,
        })
        .await
        .is_ok());
    }
}
