//! Stream configuration and administration.

use base64::Engine;
use bytes::Bytes;
use corvus_core::HeaderMap;
use serde::{Deserialize, Serialize};

use super::errors::{JetStreamError, JetStreamResult};
use super::Context;

/// Retention policy for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep messages until limits evict them.
    #[default]
    Limits,
    /// Keep messages while any consumer still wants them.
    Interest,
    /// Remove a message once one consumer acknowledges it.
    #[serde(rename = "workqueue")]
    WorkQueue,
}

/// Backing storage for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// What to do when limits are hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    #[default]
    Old,
    New,
}

fn default_replicas() -> u32 {
    1
}

/// Stream configuration, serialized as the API expects it. Duration
/// fields (`max_age`, `duplicate_window`) are nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default)]
    pub discard: DiscardPolicy,
    #[serde(default = "default_replicas")]
    pub num_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msgs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msgs_per_subject: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msg_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consumers: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_window: Option<i64>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_replicas: 1,
            ..Default::default()
        }
    }

    pub fn subjects(mut self, subjects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    pub fn max_age(mut self, age: std::time::Duration) -> Self {
        self.max_age = Some(age.as_nanos().min(i64::MAX as u128) as i64);
        self
    }

    pub fn duplicate_window(mut self, window: std::time::Duration) -> Self {
        self.duplicate_window = Some(window.as_nanos().min(i64::MAX as u128) as i64);
        self
    }

    pub fn replicas(mut self, count: u32) -> Self {
        self.num_replicas = count;
        self
    }
}

/// Counters describing the live contents of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StreamState {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub first_seq: u64,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub consumer_count: u32,
}

/// Cluster placement details, present on clustered servers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub leader: Option<String>,
}

/// Config plus live state, as returned by stream info/create/update.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub state: StreamState,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub cluster: Option<ClusterInfo>,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct PurgeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    purged: u64,
}

#[derive(Debug, Serialize)]
struct PurgeRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DeleteMessageRequest {
    seq: u64,
}

#[derive(Debug, Serialize)]
struct GetMessageRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_by_subj: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GetMessageResponse {
    message: RawStoredMessage,
}

#[derive(Debug, Deserialize)]
struct RawStoredMessage {
    subject: String,
    seq: u64,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    hdrs: Option<String>,
    #[serde(default)]
    time: String,
}

/// A message read directly out of a stream by sequence or subject.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub subject: String,
    pub sequence: u64,
    pub payload: Bytes,
    pub headers: Option<HeaderMap>,
    /// RFC 3339 receipt time, as reported by the server.
    pub time: String,
}

/// Account-level JetStream usage and limits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub storage: u64,
    #[serde(default)]
    pub streams: u32,
    #[serde(default)]
    pub consumers: u32,
    #[serde(default)]
    pub limits: AccountLimits,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountLimits {
    #[serde(default)]
    pub max_memory: i64,
    #[serde(default)]
    pub max_storage: i64,
    #[serde(default)]
    pub max_streams: i64,
    #[serde(default)]
    pub max_consumers: i64,
}

pub(crate) fn validate_stream_name(name: &str) -> JetStreamResult<()> {
    if name.is_empty() {
        return Err(JetStreamError::StreamNameRequired);
    }
    if name
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c == '/' || c == '\\' || c.is_whitespace())
    {
        return Err(JetStreamError::InvalidStreamName {
            name: name.to_owned(),
        });
    }
    Ok(())
}

impl Context {
    /// JetStream account usage (`<prefix>.INFO`).
    pub async fn account_info(&self) -> JetStreamResult<AccountInfo> {
        self.request_api("INFO", Vec::new()).await
    }

    /// Create a stream (`STREAM.CREATE.<name>`).
    pub async fn create_stream(&self, config: &StreamConfig) -> JetStreamResult<StreamInfo> {
        validate_stream_name(&config.name)?;
        if config.num_replicas == 0 {
            return Err(JetStreamError::InvalidStreamConfig {
                reason: "num_replicas must be at least 1".into(),
            });
        }
        let payload = serde_json::to_vec(config).map_err(|e| {
            JetStreamError::InvalidStreamConfig {
                reason: e.to_string(),
            }
        })?;
        self.request_api(&format!("STREAM.CREATE.{}", config.name), payload)
            .await
    }

    /// Update a stream's configuration (`STREAM.UPDATE.<name>`).
    pub async fn update_stream(&self, config: &StreamConfig) -> JetStreamResult<StreamInfo> {
        validate_stream_name(&config.name)?;
        let payload = serde_json::to_vec(config).map_err(|e| {
            JetStreamError::InvalidStreamConfig {
                reason: e.to_string(),
            }
        })?;
        self.request_api::<StreamInfo>(&format!("STREAM.UPDATE.{}", config.name), payload)
            .await
            .map_err(|e| e.for_stream(&config.name))
    }

    /// Fetch config and state for a stream (`STREAM.INFO.<name>`).
    pub async fn stream_info(&self, name: &str) -> JetStreamResult<StreamInfo> {
        validate_stream_name(name)?;
        self.request_api::<StreamInfo>(&format!("STREAM.INFO.{name}"), Vec::new())
            .await
            .map_err(|e| e.for_stream(name))
    }

    /// Delete a stream and all its consumers (`STREAM.DELETE.<name>`).
    pub async fn delete_stream(&self, name: &str) -> JetStreamResult<bool> {
        validate_stream_name(name)?;
        self.request_api::<SuccessResponse>(&format!("STREAM.DELETE.{name}"), Vec::new())
            .await
            .map(|r| r.success)
            .map_err(|e| e.for_stream(name))
    }

    /// Remove all messages from a stream (`STREAM.PURGE.<name>`).
    pub async fn purge_stream(&self, name: &str) -> JetStreamResult<u64> {
        self.purge(name, None).await
    }

    /// Remove the messages on one subject filter only.
    pub async fn purge_subject(&self, name: &str, filter: &str) -> JetStreamResult<u64> {
        self.purge(name, Some(filter)).await
    }

    async fn purge(&self, name: &str, filter: Option<&str>) -> JetStreamResult<u64> {
        validate_stream_name(name)?;
        let payload = serde_json::to_vec(&PurgeRequest { filter })
            .expect("purge request serializes");
        let response = self
            .request_api::<PurgeResponse>(&format!("STREAM.PURGE.{name}"), payload)
            .await
            .map_err(|e| e.for_stream(name))?;
        if !response.success {
            return Err(JetStreamError::Api {
                code: 500,
                err_code: 0,
                description: "purge was not successful".into(),
            });
        }
        Ok(response.purged)
    }

    /// Remove one stored message by sequence
    /// (`STREAM.MSG.DELETE.<name>`).
    pub async fn delete_message(&self, stream: &str, sequence: u64) -> JetStreamResult<bool> {
        validate_stream_name(stream)?;
        let payload = serde_json::to_vec(&DeleteMessageRequest { seq: sequence })
            .expect("delete-message request serializes");
        self.request_api::<SuccessResponse>(&format!("STREAM.MSG.DELETE.{stream}"), payload)
            .await
            .map(|r| r.success)
            .map_err(|e| e.for_stream(stream).for_message())
    }

    /// Read one stored message by sequence (`STREAM.MSG.GET.<name>`).
    pub async fn get_message(&self, stream: &str, sequence: u64) -> JetStreamResult<StoredMessage> {
        self.message_get(
            stream,
            GetMessageRequest {
                seq: Some(sequence),
                last_by_subj: None,
            },
        )
        .await
    }

    /// Read the newest stored message on a subject.
    pub async fn get_last_message(
        &self,
        stream: &str,
        subject: &str,
    ) -> JetStreamResult<StoredMessage> {
        self.message_get(
            stream,
            GetMessageRequest {
                seq: None,
                last_by_subj: Some(subject),
            },
        )
        .await
    }

    async fn message_get(
        &self,
        stream: &str,
        request: GetMessageRequest<'_>,
    ) -> JetStreamResult<StoredMessage> {
        validate_stream_name(stream)?;
        let payload = serde_json::to_vec(&request).expect("get-message request serializes");
        let response = self
            .request_api::<GetMessageResponse>(&format!("STREAM.MSG.GET.{stream}"), payload)
            .await
            .map_err(|e| e.for_stream(stream).for_message())?;
        let raw = response.message;

        let engine = base64::engine::general_purpose::STANDARD;
        let payload = match raw.data {
            Some(data) => Bytes::from(engine.decode(data).map_err(|e| {
                JetStreamError::InvalidResponse {
                    reason: format!("message data is not base64: {e}"),
                }
            })?),
            None => Bytes::new(),
        };
        let headers = match raw.hdrs {
            Some(hdrs) => {
                let block = engine.decode(hdrs).map_err(|e| JetStreamError::InvalidResponse {
                    reason: format!("message headers are not base64: {e}"),
                })?;
                Some(
                    HeaderMap::decode(&block).map_err(|e| JetStreamError::InvalidResponse {
                        reason: format!("stored header block: {e}"),
                    })?,
                )
            }
            None => None,
        };

        Ok(StoredMessage {
            subject: raw.subject,
            sequence: raw.seq,
            payload,
            headers,
            time: raw.time,
        })
    }
}
