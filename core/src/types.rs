/// Shared types for the chat delivery layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One direct message between two users.
///
/// `id` and `created_at` are assigned by the store when the message is
/// persisted and never change afterwards. `created_at` is the sole ordering
/// key for conversation views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Unordered pair of user ids identifying a two-party conversation.
///
/// The pair is normalized on construction so `new("a", "b")` and
/// `new("b", "a")` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationKey {
    lo: String,
    hi: String,
}

impl ConversationKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self {
                lo: a.to_string(),
                hi: b.to_string(),
            }
        } else {
            Self {
                lo: b.to_string(),
                hi: a.to_string(),
            }
        }
    }

    /// A message belongs to the conversation iff its (sender, recipient)
    /// pair equals the key in either direction.
    pub fn matches(&self, msg: &Message) -> bool {
        *self == Self::new(&msg.sender, &msg.recipient)
    }

    /// Canonical ID: "dm:{min_id}:{max_id}" (used in logs)
    pub fn canonical_id(&self) -> String {
        format!("dm:{}:{}", self.lo, self.hi)
    }
}

/// Realtime events delivered by a store subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    /// A new message was persisted
    Created { message: Message },
    /// An existing message changed (e.g. edited text)
    Updated { message: Message },
    /// A message was removed from the store
    Deleted { message: Message },
}

impl MessageEvent {
    pub fn message(&self) -> &Message {
        match self {
            MessageEvent::Created { message }
            | MessageEvent::Updated { message }
            | MessageEvent::Deleted { message } => message,
        }
    }
}
