//! One-way notifications to the background network intermediary
//!
//! The intermediary runs out of band and owns its own response cache. We can
//! only ask it to purge or re-version that cache. Each message carries a reply
//! slot; an acknowledgment must arrive within the configured window or the
//! notification counts as failed. Failed notifications are not retried.

use crate::error::CacheError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// What the intermediary is asked to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum IntermediaryAction {
    /// Purge one key, or everything when `key` is `None`
    ClearCache {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },

    /// Re-version cached responses
    UpdateCacheVersion { version: String },
}

impl IntermediaryAction {
    pub fn purge_all() -> Self {
        IntermediaryAction::ClearCache { key: None }
    }

    pub fn purge_key(key: impl Into<String>) -> Self {
        IntermediaryAction::ClearCache {
            key: Some(key.into()),
        }
    }

    pub fn update_version(version: impl Into<String>) -> Self {
        IntermediaryAction::UpdateCacheVersion {
            version: version.into(),
        }
    }

    /// Wire name, also used to correlate acknowledgments
    pub fn name(&self) -> &'static str {
        match self {
            IntermediaryAction::ClearCache { .. } => "clearCache",
            IntermediaryAction::UpdateCacheVersion { .. } => "updateCacheVersion",
        }
    }
}

impl fmt::Display for IntermediaryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntermediaryAction::ClearCache { key: Some(key) } => write!(f, "clearCache({})", key),
            IntermediaryAction::ClearCache { key: None } => f.write_str("clearCache(*)"),
            IntermediaryAction::UpdateCacheVersion { version } => {
                write!(f, "updateCacheVersion({})", version)
            }
        }
    }
}

/// Message as sent over the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediaryMessage {
    pub id: Uuid,
    #[serde(flatten)]
    pub action: IntermediaryAction,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl IntermediaryMessage {
    pub fn new(action: IntermediaryAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// Reply from the intermediary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub action: String,
    pub status: AckStatus,
}

impl Ack {
    /// Successful acknowledgment for `message`
    pub fn success(message: &IntermediaryMessage) -> Self {
        Self {
            action: message.action.name().to_string(),
            status: AckStatus::Success,
        }
    }
}

/// A message plus the slot its acknowledgment goes into
#[derive(Debug)]
pub struct Envelope {
    pub message: IntermediaryMessage,
    pub reply: oneshot::Sender<Ack>,
}

impl Envelope {
    /// Acknowledge successfully. Returns false if the sender stopped waiting.
    pub fn acknowledge(self) -> bool {
        let ack = Ack::success(&self.message);
        self.reply.send(ack).is_ok()
    }
}

/// Sending half registered with the [`Notifier`]
#[derive(Debug, Clone)]
pub struct IntermediaryHandle {
    tx: mpsc::Sender<Envelope>,
}

impl IntermediaryHandle {
    /// Create a handle and the receiver the background process drains
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Whether the receiving side is still alive
    pub fn is_active(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Transports actions to the intermediary, if one is registered
#[derive(Debug)]
pub struct Notifier {
    handle: RwLock<Option<IntermediaryHandle>>,
    ack_timeout: Duration,
}

impl Notifier {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            handle: RwLock::new(None),
            ack_timeout,
        }
    }

    /// Create a notifier with an intermediary already registered
    pub fn with_handle(ack_timeout: Duration, handle: IntermediaryHandle) -> Self {
        Self {
            handle: RwLock::new(Some(handle)),
            ack_timeout,
        }
    }

    pub async fn register(&self, handle: IntermediaryHandle) {
        debug!("Intermediary registered");
        *self.handle.write().await = Some(handle);
    }

    pub async fn unregister(&self) {
        debug!("Intermediary unregistered");
        *self.handle.write().await = None;
    }

    /// Registered and its receiver still alive
    pub async fn is_active(&self) -> bool {
        self.handle
            .read()
            .await
            .as_ref()
            .map(IntermediaryHandle::is_active)
            .unwrap_or(false)
    }

    /// Send `action` and wait for a matching acknowledgment.
    ///
    /// Returns false when nothing is registered, the channel is closed, the
    /// reply does not match, or the wait times out.
    pub async fn notify(&self, action: IntermediaryAction) -> bool {
        let handle = match self.handle.read().await.clone() {
            Some(handle) if handle.is_active() => handle,
            _ => {
                debug!("No active intermediary, skipping {}", action);
                return false;
            }
        };

        let message = IntermediaryMessage::new(action);
        let expected = message.action.name();
        let description = message.action.to_string();
        let (reply, ack) = oneshot::channel();

        let exchange = async {
            handle.tx.send(Envelope { message, reply }).await.ok()?;
            ack.await.ok()
        };

        match tokio::time::timeout(self.ack_timeout, exchange).await {
            Ok(Some(ack)) if ack.action == expected && ack.status == AckStatus::Success => {
                debug!("Intermediary acknowledged {}", description);
                true
            }
            Ok(Some(ack)) => {
                warn!(
                    "Intermediary rejected {}: {:?} for '{}'",
                    description, ack.status, ack.action
                );
                false
            }
            Ok(None) => {
                warn!("Intermediary went away before acknowledging {}", description);
                false
            }
            Err(_) => {
                let e = CacheError::NotifierTimeout {
                    action: expected.to_string(),
                    timeout_ms: self.ack_timeout.as_millis() as u64,
                };
                warn!("{}", e);
                false
            }
        }
    }
}
