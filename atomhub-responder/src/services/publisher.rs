//! Outbound notification publishing
//!
//! Downstream systems learn about imports through messages published to
//! the broker exchange. The publish path must not drop messages: on
//! failure it retries with a fixed short delay until the broker accepts.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Where outbound messages go; implemented by the broker bridge and by
/// in-memory doubles in tests
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, routing_key: &str, payload: &Value) -> anyhow::Result<()>;
}

/// Publishes through an inner sink, looping with a fixed delay until the
/// message is accepted
pub struct RetryingPublisher {
    sink: Arc<dyn NotificationSink>,
    delay: Duration,
}

impl RetryingPublisher {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            delay: Duration::from_secs(3),
        }
    }

    #[cfg(test)]
    fn with_delay(sink: Arc<dyn NotificationSink>, delay: Duration) -> Self {
        Self { sink, delay }
    }

    pub async fn publish(&self, routing_key: &str, payload: &Value) {
        loop {
            match self.sink.publish(routing_key, payload).await {
                Ok(()) => {
                    info!("Published notification with routing-key {}", routing_key);
                    return;
                }
                Err(e) => {
                    error!(
                        "Could not route message to broker ({}), retrying in {:?}...",
                        e, self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}

/// Broker bridge sink: publishes to the exchange through the broker's
/// HTTP API (the AMQP client itself is an external collaborator)
pub struct HttpBrokerSink {
    client: reqwest::Client,
    api_url: String,
    vhost: String,
    exchange: String,
    username: String,
    password: String,
}

impl HttpBrokerSink {
    pub fn new(
        api_url: &str,
        vhost: &str,
        exchange: &str,
        username: &str,
        password: &str,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            vhost: vhost.to_string(),
            exchange: exchange.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[async_trait]
impl NotificationSink for HttpBrokerSink {
    async fn publish(&self, routing_key: &str, payload: &Value) -> anyhow::Result<()> {
        let url = format!(
            "{}/exchanges/{}/{}/publish",
            self.api_url,
            urlencode(&self.vhost),
            self.exchange
        );

        let body = serde_json::json!({
            "routing_key": routing_key,
            "payload": payload.to_string(),
            "payload_encoding": "string",
            "properties": {"content_type": "application/json"},
        });

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("broker publish returned {}", status);
        }

        #[derive(serde::Deserialize)]
        struct PublishResult {
            routed: bool,
        }
        let result: PublishResult = response.json().await?;
        if !result.routed {
            anyhow::bail!("broker accepted but did not route the message");
        }
        Ok(())
    }
}

fn urlencode(s: &str) -> String {
    // only the vhost needs escaping and "/" is the common case
    s.replace('/', "%2F")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every publish; optionally fails the first N attempts
    pub struct RecordingSink {
        pub published: Mutex<Vec<(String, Value)>>,
        pub failures_remaining: Mutex<u32>,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
                failures_remaining: Mutex::new(0),
            })
        }

        pub fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
                failures_remaining: Mutex::new(times),
            })
        }

        pub fn take(&self) -> Vec<(String, Value)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn publish(&self, routing_key: &str, payload: &Value) -> anyhow::Result<()> {
            {
                let mut remaining = self.failures_remaining.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("simulated broker outage");
                }
            }
            self.published
                .lock()
                .unwrap()
                .push((routing_key.to_string(), payload.clone()));
            Ok(())
        }
    }
}
