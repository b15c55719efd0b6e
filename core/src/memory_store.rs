/// In-memory reference store
///
/// Implements the full collaborator surface (persistence, ordered queries,
/// realtime events, user directory) against a plain in-process table.
/// Non-persistent; rows are gone when the process exits. Used as the test
/// backend and as the reference semantics for real backends.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::store::{ChatStore, Subscription, UserDirectory};
use crate::types::{ConversationKey, Message, MessageEvent};

/// Broadcast buffer for realtime events; slow subscribers lag past this.
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct MemoryStore {
    /// The signed-in user this store instance acts for
    user: String,

    /// Message table
    rows: RwLock<Vec<Message>>,

    /// Realtime event fan-out; subscriptions filter per conversation
    events: broadcast::Sender<MessageEvent>,

    /// When false, `subscribe` fails and delivery degrades to poll-only
    realtime: bool,
}

impl MemoryStore {
    pub fn new(user: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            user: user.to_string(),
            rows: RwLock::new(Vec::new()),
            events,
            realtime: true,
        }
    }

    /// Store whose realtime channel is down: `subscribe` returns an error,
    /// so consumers run on polls alone.
    pub fn without_realtime(user: &str) -> Self {
        Self {
            realtime: false,
            ..Self::new(user)
        }
    }

    /// Persist a message with an explicit timestamp (history seeding).
    pub async fn create_message_at(
        &self,
        sender: &str,
        recipient: &str,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            text: text.to_string(),
            created_at,
        };
        self.rows.write().await.push(message.clone());
        self.emit(MessageEvent::Created {
            message: message.clone(),
        });
        message
    }

    /// Replace the text of an existing message. Returns false if no row matched.
    pub async fn update_message(&self, id: &str, text: &str) -> Result<bool> {
        let updated = {
            let mut rows = self.rows.write().await;
            match rows.iter_mut().find(|m| m.id == id) {
                Some(row) => {
                    row.text = text.to_string();
                    Some(row.clone())
                }
                None => None,
            }
        };
        match updated {
            Some(message) => {
                self.emit(MessageEvent::Updated { message });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a message. Returns false if no row matched.
    pub async fn delete_message(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut rows = self.rows.write().await;
            match rows.iter().position(|m| m.id == id) {
                Some(pos) => Some(rows.remove(pos)),
                None => None,
            }
        };
        match removed {
            Some(message) => {
                self.emit(MessageEvent::Deleted { message });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Push a raw event onto the realtime channel without touching the table.
    /// Lets tests replay duplicate or malformed events.
    pub fn emit(&self, event: MessageEvent) {
        // No receivers is fine; the poll path covers delivery
        let _ = self.events.send(event);
    }

    /// Number of stored messages
    pub async fn message_count(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_message(&self, sender: &str, recipient: &str, text: &str) -> Result<Message> {
        Ok(self
            .create_message_at(sender, recipient, text, Utc::now())
            .await)
    }

    async fn query_conversation(
        &self,
        key: &ConversationKey,
        newer_than: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let rows = self.rows.read().await;
        let mut out: Vec<Message> = rows
            .iter()
            .filter(|m| key.matches(m))
            .filter(|m| match newer_than {
                Some(t) => m.created_at > t,
                None => true,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn subscribe(&self, key: &ConversationKey) -> Result<Subscription> {
        if !self.realtime {
            return Err(ChatError::Subscription(
                "realtime channel unavailable".to_string(),
            ));
        }
        Ok(Subscription::new(key.clone(), self.events.subscribe()))
    }
}

impl UserDirectory for MemoryStore {
    fn current_user(&self) -> Result<String> {
        Ok(self.user.clone())
    }
}
