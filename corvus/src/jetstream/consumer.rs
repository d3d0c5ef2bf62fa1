//! Consumer configuration, administration, and the pull fetch loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::errors::{JetStreamError, JetStreamResult};
use super::message::JetStreamMessage;
use super::stream::validate_stream_name;
use super::Context;

/// Where delivery starts for a new consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
    ByStartSequence,
    ByStartTime,
    LastPerSubject,
}

/// How deliveries must be acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Every message individually.
    #[default]
    Explicit,
    /// Acking one message acks everything before it.
    All,
    None,
}

/// Replay pacing for replayed messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

/// Consumer configuration in API wire form. Duration fields
/// (`ack_wait`, `inactive_threshold`, `backoff`) are nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_time: Option<String>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waiting: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backoff: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_threshold: Option<i64>,
}

impl ConsumerConfig {
    /// A durable pull consumer with explicit acks.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn ack_wait(mut self, wait: Duration) -> Self {
        self.ack_wait = Some(wait.as_nanos().min(i64::MAX as u128) as i64);
        self
    }

    pub fn filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    pub fn max_ack_pending(mut self, max: i64) -> Self {
        self.max_ack_pending = Some(max);
        self
    }

    /// The effective consumer name: `name` wins over `durable_name`.
    pub fn effective_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.durable_name.as_deref())
    }
}

/// Delivered/acked sequence positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SequenceInfo {
    #[serde(default)]
    pub consumer_seq: u64,
    #[serde(default)]
    pub stream_seq: u64,
}

/// Consumer state as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub config: ConsumerConfig,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub delivered: SequenceInfo,
    #[serde(default)]
    pub ack_floor: SequenceInfo,
    #[serde(default)]
    pub num_ack_pending: u64,
    #[serde(default)]
    pub num_redelivered: u64,
    #[serde(default)]
    pub num_waiting: u64,
    #[serde(default)]
    pub num_pending: u64,
}

#[derive(Debug, Serialize)]
struct CreateConsumerRequest<'a> {
    stream_name: &'a str,
    config: &'a ConsumerConfig,
}

#[derive(Debug, Serialize)]
struct NextMessageRequest {
    batch: usize,
    /// Server-side wait, nanoseconds.
    expires: u64,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

fn validate_consumer_name(name: &str) -> JetStreamResult<()> {
    if name.is_empty() {
        return Err(JetStreamError::ConsumerNameRequired);
    }
    if name
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(JetStreamError::InvalidConsumerName {
            name: name.to_owned(),
        });
    }
    Ok(())
}

impl Context {
    /// Create (or look up an identically configured) consumer on a
    /// stream (`CONSUMER.CREATE.<stream>[.<name>]`).
    pub async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> JetStreamResult<Consumer> {
        validate_stream_name(stream)?;
        if let Some(name) = config.effective_name() {
            validate_consumer_name(name)?;
        }
        if config.ack_policy == AckPolicy::None && config.max_ack_pending.is_some() {
            return Err(JetStreamError::InvalidConsumerConfig {
                reason: "max_ack_pending requires an acking policy".into(),
            });
        }

        let suffix = match config.effective_name() {
            Some(name) => format!("CONSUMER.CREATE.{stream}.{name}"),
            None => format!("CONSUMER.CREATE.{stream}"),
        };
        let request = CreateConsumerRequest {
            stream_name: stream,
            config: &config,
        };
        let payload = serde_json::to_vec(&request).map_err(|e| {
            JetStreamError::InvalidConsumerConfig {
                reason: e.to_string(),
            }
        })?;
        let info: ConsumerInfo = self
            .request_api(&suffix, payload)
            .await
            .map_err(|e| e.for_stream(stream))?;
        Ok(Consumer {
            context: self.clone(),
            stream: info.stream_name.clone(),
            name: info.name.clone(),
            info,
        })
    }

    /// Look up an existing consumer (`CONSUMER.INFO.<stream>.<name>`).
    pub async fn get_consumer(&self, stream: &str, name: &str) -> JetStreamResult<Consumer> {
        let info = self.consumer_info(stream, name).await?;
        Ok(Consumer {
            context: self.clone(),
            stream: info.stream_name.clone(),
            name: info.name.clone(),
            info,
        })
    }

    /// Consumer state (`CONSUMER.INFO.<stream>.<name>`).
    pub async fn consumer_info(&self, stream: &str, name: &str) -> JetStreamResult<ConsumerInfo> {
        validate_stream_name(stream)?;
        validate_consumer_name(name)?;
        self.request_api::<ConsumerInfo>(&format!("CONSUMER.INFO.{stream}.{name}"), Vec::new())
            .await
            .map_err(|e| e.for_consumer(stream, name))
    }

    /// Delete a consumer (`CONSUMER.DELETE.<stream>.<name>`).
    pub async fn delete_consumer(&self, stream: &str, name: &str) -> JetStreamResult<bool> {
        validate_stream_name(stream)?;
        validate_consumer_name(name)?;
        self.request_api::<SuccessResponse>(
            &format!("CONSUMER.DELETE.{stream}.{name}"),
            Vec::new(),
        )
        .await
        .map(|r| r.success)
        .map_err(|e| e.for_consumer(stream, name))
    }
}

/// A pull consumer bound to one stream.
#[derive(Debug, Clone)]
pub struct Consumer {
    context: Context,
    stream: String,
    name: String,
    info: ConsumerInfo,
}

impl Consumer {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consumer state captured at creation/lookup time.
    pub fn cached_info(&self) -> &ConsumerInfo {
        &self.info
    }

    /// Fresh consumer state from the server.
    pub async fn info(&self) -> JetStreamResult<ConsumerInfo> {
        self.context.consumer_info(&self.stream, &self.name).await
    }

    /// Pull up to `batch` messages, waiting at most `max_wait`.
    ///
    /// Collection stops as soon as the batch is full, the deadline
    /// passes, or a terminal status message (404 no messages, 408
    /// request expired, or any ≥400) arrives. Messages whose reply
    /// subject does not parse as an ack subject are skipped.
    pub async fn fetch(
        &self,
        batch: usize,
        max_wait: Duration,
    ) -> JetStreamResult<Vec<JetStreamMessage>> {
        let client = self.context.client().clone();
        let inbox = corvus_core::new_inbox(client.inbox_prefix(), &mut rand::thread_rng());
        let mut sub = client
            .subscribe(&inbox)
            .await
            .map_err(|e| JetStreamError::PullFailed {
                reason: format!("inbox subscribe: {e}"),
            })?;

        let request = NextMessageRequest {
            batch,
            expires: max_wait.as_nanos().min(u64::MAX as u128) as u64,
        };
        let subject = self
            .context
            .api_subject(&format!("CONSUMER.MSG.NEXT.{}.{}", self.stream, self.name));
        let payload = serde_json::to_vec(&request).expect("next request serializes");
        client
            .publish_with_reply(&subject, &inbox, payload)
            .await
            .map_err(|e| JetStreamError::PullFailed {
                reason: format!("next-message request: {e}"),
            })?;

        let deadline = tokio::time::Instant::now() + max_wait;
        let mut messages = Vec::with_capacity(batch);
        while messages.len() < batch {
            let next = tokio::time::timeout_at(deadline, sub.next()).await;
            match next {
                Err(_) => break,      // deadline
                Ok(None) => break,    // subscription finished (client closing)
                Ok(Some(message)) => {
                    if let Some(status) = message.status() {
                        if status >= 400 {
                            trace!(status, "terminal pull status");
                            break;
                        }
                        // informational status (e.g. heartbeats): skip
                        continue;
                    }
                    match JetStreamMessage::try_parse(client.clone(), message) {
                        Ok(js_message) => messages.push(js_message),
                        Err(_) => trace!("skipping non-jetstream message on pull inbox"),
                    }
                }
            }
        }

        let _ = sub.unsubscribe().await;
        debug!(
            stream = %self.stream,
            consumer = %self.name,
            fetched = messages.len(),
            "pull fetch complete"
        );
        Ok(messages)
    }
}
