//! Invalidation events broadcast to in-process listeners
//!
//! Components that render cached images subscribe to these to drop their own
//! derived state. Delivery is best-effort: a lagging receiver loses events
//! instead of slowing the coordinator down.

use crate::cache::version::VersionToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheEventKind {
    /// Some entries were removed
    Invalidate,

    /// Version token advanced
    Update,

    /// Everything was removed
    Clear,
}

/// How wide the change was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventScope {
    Key,
    Category,
    Prefix,
    All,
}

impl fmt::Display for EventScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventScope::Key => write!(f, "key"),
            EventScope::Category => write!(f, "category"),
            EventScope::Prefix => write!(f, "prefix"),
            EventScope::All => write!(f, "all"),
        }
    }
}

/// Event published after an invalidation or version change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub scope: EventScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CacheEvent {
    fn new(kind: CacheEventKind, scope: EventScope, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            key: None,
            category: None,
            prefix: None,
            scope,
            version: None,
            timestamp,
        }
    }

    pub fn key_invalidated(key: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(CacheEventKind::Invalidate, EventScope::Key, at)
        }
    }

    pub fn category_invalidated(category: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            category: Some(category.into()),
            ..Self::new(CacheEventKind::Invalidate, EventScope::Category, at)
        }
    }

    pub fn prefix_invalidated(prefix: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::new(CacheEventKind::Invalidate, EventScope::Prefix, at)
        }
    }

    pub fn cleared(at: DateTime<Utc>) -> Self {
        Self::new(CacheEventKind::Clear, EventScope::All, at)
    }

    /// A version advance, scoped like the token
    pub fn version_updated(token: &VersionToken, at: DateTime<Utc>) -> Self {
        use crate::cache::version::VersionScope;

        let mut event = match &token.scope {
            VersionScope::Global => Self::new(CacheEventKind::Update, EventScope::All, at),
            VersionScope::Category(c) => Self {
                category: Some(c.clone()),
                ..Self::new(CacheEventKind::Update, EventScope::Category, at)
            },
            VersionScope::Prefix(p) => Self {
                prefix: Some(p.clone()),
                ..Self::new(CacheEventKind::Update, EventScope::Prefix, at)
            },
        };
        event.version = Some(token.to_string());
        event
    }
}

/// Broadcast channel for [`CacheEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, event: CacheEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!("No subscribers for {:?} event", event.kind);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
