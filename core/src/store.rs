/// Collaborator contracts implemented by the backend layer
///
/// The coordinator never talks to a concrete backend directly: persistence,
/// querying and the realtime channel are reached through these traits so the
/// delivery logic can be driven by any store (remote BaaS, SQL table,
/// in-memory fake in tests).
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::Result;
use crate::types::{ConversationKey, Message, MessageEvent};

/// Message persistence and realtime channel
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a new message. The store assigns `id` and `created_at`.
    async fn create_message(&self, sender: &str, recipient: &str, text: &str) -> Result<Message>;

    /// Fetch messages of one conversation, ascending by `created_at`,
    /// optionally restricted to `created_at > newer_than`.
    async fn query_conversation(
        &self,
        key: &ConversationKey,
        newer_than: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Open a realtime subscription filtered to one conversation.
    async fn subscribe(&self, key: &ConversationKey) -> Result<Subscription>;
}

/// User directory (auth layer)
pub trait UserDirectory: Send + Sync {
    /// ID of the signed-in user
    fn current_user(&self) -> Result<String>;
}

/// Live subscription to a conversation's create/update/delete events.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    key: ConversationKey,
    rx: broadcast::Receiver<MessageEvent>,
}

impl Subscription {
    pub fn new(key: ConversationKey, rx: broadcast::Receiver<MessageEvent>) -> Self {
        Self { key, rx }
    }

    /// Next event for this conversation, or `None` once the store side is gone.
    ///
    /// Events for other conversations are skipped; a lagged receiver logs and
    /// keeps going (the poll loop backfills anything dropped here).
    pub async fn recv(&mut self) -> Option<MessageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.key.matches(event.message()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Subscription lagged {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
