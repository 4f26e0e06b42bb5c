//! Consumer supervision
//!
//! One task per delivery source, all supervised together: if any
//! consumer dies the whole set is cancelled so the process can exit and
//! be restarted by the service manager rather than limp along with a
//! silent stream.

use crate::router::{AckDecision, Delivery, DispatchRouter};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A stream of deliveries (one consumed queue)
#[async_trait]
pub trait DeliverySource: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for the next delivery. `Ok(None)` means the stream closed.
    async fn next(&self) -> anyhow::Result<Option<Delivery>>;

    /// Report the dispatch decision back to the transport
    async fn settle(&self, delivery: &Delivery, decision: AckDecision) -> anyhow::Result<()>;
}

/// Run one consumer loop per source until shutdown is requested or a
/// consumer fails. A closed or failed stream is an error: every source
/// is expected to deliver forever.
pub async fn run_consumers(
    sources: Vec<Arc<dyn DeliverySource>>,
    router: Arc<DispatchRouter>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut tasks = JoinSet::new();

    for source in sources {
        let router = Arc::clone(&router);
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let name = source.name().to_string();
            info!("Consumer for {} starting", name);
            loop {
                let delivery = tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Consumer for {} shutting down", name);
                        return Ok(());
                    }
                    next = source.next() => next,
                };

                match delivery {
                    Ok(Some(delivery)) => {
                        let decision = router.dispatch(&delivery).await;
                        if let Err(e) = source.settle(&delivery, decision).await {
                            anyhow::bail!("{}: could not settle delivery: {}", name, e);
                        }
                    }
                    Ok(None) => anyhow::bail!("{}: delivery stream closed", name),
                    Err(e) => anyhow::bail!("{}: consumer failed: {}", name, e),
                }
            }
        });
    }

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{}", e);
                // take the rest of the consumers down with it
                shutdown.cancel();
                if result.is_ok() {
                    result = Err(e);
                }
            }
            Err(e) => {
                error!("Consumer task panicked: {}", e);
                shutdown.cancel();
                if result.is_ok() {
                    result = Err(anyhow::anyhow!("consumer task panicked: {}", e));
                }
            }
        }
    }
    result
}

/// Delivery-source settings for one consumed queue
#[derive(Debug, Clone)]
pub struct QueueBinding {
    /// Source name the router matches on
    pub source: String,
    pub queue: String,
}

const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Consumes a queue through the broker bridge's HTTP API.
///
/// Messages are removed from the queue when fetched, so a Requeue
/// decision is realised by publishing the message back to its queue with
/// the retry counter header incremented; the counter is what the router
/// reads as `retry_count`.
pub struct PollingQueueSource {
    client: reqwest::Client,
    api_url: String,
    vhost: String,
    username: String,
    password: String,
    binding: QueueBinding,
    poll_interval: Duration,
}

impl PollingQueueSource {
    pub fn new(
        api_url: &str,
        vhost: &str,
        username: &str,
        password: &str,
        binding: QueueBinding,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            vhost: vhost.replace('/', "%2F"),
            username: username.to_string(),
            password: password.to_string(),
            binding,
            poll_interval: Duration::from_secs(1),
        }
    }

    fn queue_url(&self, suffix: &str) -> String {
        format!(
            "{}/queues/{}/{}/{}",
            self.api_url, self.vhost, self.binding.queue, suffix
        )
    }

    async fn fetch_one(&self) -> anyhow::Result<Option<Delivery>> {
        #[derive(serde::Deserialize)]
        struct Fetched {
            routing_key: String,
            payload: String,
            properties: serde_json::Value,
        }

        let response = self
            .client
            .post(self.queue_url("get"))
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({
                "count": 1,
                "ackmode": "ack_requeue_false",
                "encoding": "auto",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("queue get returned {}", status);
        }

        let mut messages: Vec<Fetched> = response.json().await?;
        let Some(message) = messages.pop() else {
            return Ok(None);
        };

        let retry_count = message
            .properties
            .pointer(&format!("/headers/{}", RETRY_COUNT_HEADER))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;

        Ok(Some(Delivery {
            source: self.binding.source.clone(),
            routing_key: message.routing_key,
            body: message.payload.into_bytes(),
            retry_count,
        }))
    }
}

#[async_trait]
impl DeliverySource for PollingQueueSource {
    fn name(&self) -> &str {
        &self.binding.source
    }

    async fn next(&self) -> anyhow::Result<Option<Delivery>> {
        loop {
            if let Some(delivery) = self.fetch_one().await? {
                return Ok(Some(delivery));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn settle(&self, delivery: &Delivery, decision: AckDecision) -> anyhow::Result<()> {
        match decision {
            // already removed from the queue by the fetch
            AckDecision::Ack => Ok(()),
            AckDecision::Reject => {
                warn!(
                    "Dropping {} message with key {}",
                    delivery.source, delivery.routing_key
                );
                Ok(())
            }
            AckDecision::Requeue => {
                let response = self
                    .client
                    .post(self.queue_url("publish"))
                    .basic_auth(&self.username, Some(&self.password))
                    .json(&json!({
                        "routing_key": delivery.routing_key,
                        "payload": String::from_utf8_lossy(&delivery.body),
                        "payload_encoding": "string",
                        "properties": {
                            "headers": {RETRY_COUNT_HEADER: delivery.retry_count + 1}
                        },
                    }))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    anyhow::bail!("requeue publish returned {}", response.status());
                }
                Ok(())
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{ChannelSource, FailingSource};
    use super::*;
    use crate::error::ProcessError;
    use crate::router::{FailurePolicy, MessageProcessor};
    use crate::services::publisher::test_support::RecordingSink;
    use serde_json::Value;

    struct AlwaysOk;

    #[async_trait]
    impl MessageProcessor for AlwaysOk {
        async fn process(&self, _: &Delivery, _: &Value) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    fn router() -> Arc<DispatchRouter> {
        Arc::new(
            DispatchRouter::new(RecordingSink::new(), 32, "atomhub-dead-letter").route(
                "media-atom",
                "*",
                FailurePolicy::RetryRepublish,
                Arc::new(AlwaysOk),
            ),
        )
    }

    fn delivery(key: &str) -> Delivery {
        Delivery {
            source: "media-atom".to_string(),
            routing_key: key.to_string(),
            body: br#"{"type": "x"}"#.to_vec(),
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn test_deliveries_are_dispatched_and_settled() {
        let (source, sender) = ChannelSource::new("media-atom");
        sender.send(delivery("one")).unwrap();
        sender.send(delivery("two")).unwrap();

        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(run_consumers(
            vec![source.clone() as Arc<dyn DeliverySource>],
            router(),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        supervisor.await.unwrap().unwrap();

        let settled = source.settled.lock().unwrap();
        assert_eq!(
            settled.as_slice(),
            &[
                ("one".to_string(), AckDecision::Ack),
                ("two".to_string(), AckDecision::Ack)
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_consumer_cancels_the_rest() {
        let (healthy, _sender) = ChannelSource::new("media-atom");
        let shutdown = CancellationToken::new();

        let result = run_consumers(
            vec![
                healthy as Arc<dyn DeliverySource>,
                Arc::new(FailingSource),
            ],
            router(),
            shutdown.clone(),
        )
        .await;

        assert!(result.is_err());
        assert!(shutdown.is_cancelled());
    }
}
