/// Coordinator configuration
use std::time::Duration;

/// Tuning knobs for a [`ChatCoordinator`](crate::coordinator::ChatCoordinator) instance.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interval between background polls for new messages.
    /// The poll loop runs even when the realtime subscription is healthy;
    /// it is the reliability backstop, not a fallback.
    pub poll_interval: Duration,

    /// Maximum number of messages fetched when a conversation is opened.
    pub initial_fetch_limit: usize,

    /// Treat an update event for an unknown message as a create.
    /// Matches the historical backend behavior, but can resurrect a message
    /// deleted moments earlier when events arrive out of order. Kept
    /// configurable so the fallback is observable in tests.
    pub resurrect_unknown_updates: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            initial_fetch_limit: 1000,
            resurrect_unknown_updates: true,
        }
    }
}
