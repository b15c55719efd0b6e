/// ChatSync - merged realtime + polling chat delivery
///
/// Library component behind a direct-message UI: one coordinator per open
/// conversation reconciles a realtime event subscription with a periodic
/// poll into a single ordered, deduplicated message list, exposed as an
/// observable snapshot stream. The backend (persistence, queries, realtime
/// channel, auth) is reached through collaborator traits.

pub mod error;
pub mod config;
pub mod types;
pub mod store;
pub mod memory_store;
pub mod coordinator;

pub use error::{ChatError, Result};
pub use config::CoordinatorConfig;
pub use types::{ConversationKey, Message, MessageEvent};
pub use store::{ChatStore, Subscription, UserDirectory};
pub use memory_store::MemoryStore;
pub use coordinator::{ChatCoordinator, Phase};
