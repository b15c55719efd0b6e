/// Message delivery coordinator
///
/// Owns the merged view of one two-party conversation. Two delivery channels
/// run concurrently: a realtime subscription pushes create/update/delete
/// events, and a periodic poll pulls anything newer than the high watermark.
/// Both feed the same reconciliation path, which dedups by message id, keeps
/// the list sorted ascending by `created_at`, and publishes a full snapshot
/// to observers after every mutation.
///
/// The poll loop is not a fallback: it runs alongside a healthy subscription
/// as the reliability backstop. If subscription setup fails, delivery
/// degrades to poll-only and stays correct.
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::store::{ChatStore, Subscription, UserDirectory};
use crate::types::{ConversationKey, Message, MessageEvent};

/// Coordinator lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No active conversation
    Idle,
    /// Conversation opened, initial fetch in flight
    Loading,
    /// Subscription and poll loop running, messages flowing
    Live,
}

/// Per-conversation state. Every mutation happens under one mutex: the
/// initial fetch, the subscription loop, the poll loop and the public API
/// all funnel through it, so their completions can interleave in any order.
struct ConversationState {
    /// Bumped on every open/close; tasks spawned for an older epoch must
    /// not touch state (stale-response guard)
    epoch: u64,
    phase: Phase,
    me: Option<String>,
    other: Option<String>,
    key: Option<ConversationKey>,
    /// Ascending by `created_at` after every mutation
    messages: Vec<Message>,
    /// Ids already incorporated into `messages`
    seen: HashSet<String>,
    /// `created_at` of the newest incorporated message; only moves forward
    high_watermark: Option<DateTime<Utc>>,
    /// Whether the poll loop does work on its ticks
    polling: bool,
    /// Background tasks of the current conversation
    tasks: Vec<JoinHandle<()>>,
}

impl ConversationState {
    fn new() -> Self {
        Self {
            epoch: 0,
            phase: Phase::Idle,
            me: None,
            other: None,
            key: None,
            messages: Vec::new(),
            seen: HashSet::new(),
            high_watermark: None,
            polling: false,
            tasks: Vec::new(),
        }
    }

    /// Cancel tasks and reset to Idle. Idempotent.
    fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.epoch += 1;
        self.phase = Phase::Idle;
        self.me = None;
        self.other = None;
        self.key = None;
        self.messages.clear();
        self.seen.clear();
        self.high_watermark = None;
        self.polling = false;
    }
}

struct Inner {
    store: Arc<dyn ChatStore>,
    users: Arc<dyn UserDirectory>,
    config: CoordinatorConfig,
    state: Mutex<ConversationState>,
    snapshot: watch::Sender<Vec<Message>>,
}

/// Merged realtime + poll delivery for one conversation at a time.
///
/// One instance per UI surface, explicitly closed by its owner; opening a
/// new conversation tears the previous one down first.
pub struct ChatCoordinator {
    inner: Arc<Inner>,
}

impl ChatCoordinator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        users: Arc<dyn UserDirectory>,
        config: CoordinatorConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Inner {
                store,
                users,
                config,
                state: Mutex::new(ConversationState::new()),
                snapshot,
            }),
        }
    }

    /// Open the conversation with `other` and return the observable message
    /// list. Tears down any previous conversation, runs the initial bulk
    /// fetch, attaches the realtime subscription and starts the poll loop.
    ///
    /// A subscription setup failure is logged and delivery continues
    /// poll-only; it is not an error to the caller.
    pub async fn open_conversation(&self, other: &str) -> Result<watch::Receiver<Vec<Message>>> {
        let me = self.inner.users.current_user()?;
        let key = ConversationKey::new(&me, other);

        let epoch = {
            let mut st = self.inner.state.lock().await;
            st.teardown();
            st.phase = Phase::Loading;
            st.me = Some(me);
            st.other = Some(other.to_string());
            st.key = Some(key.clone());
            st.epoch
        };
        self.inner.snapshot.send_replace(Vec::new());
        info!("Opening conversation {}", key.canonical_id());

        let fetch_task = tokio::spawn(self.inner.clone().run_initial_fetch(key.clone(), epoch));

        let event_task = match self.inner.store.subscribe(&key).await {
            Ok(sub) => Some(tokio::spawn(self.inner.clone().run_event_loop(sub, epoch))),
            Err(e) => {
                warn!(
                    "Subscription setup failed for {}, continuing poll-only: {}",
                    key.canonical_id(),
                    e
                );
                None
            }
        };

        let mut st = self.inner.state.lock().await;
        if st.epoch != epoch {
            // Another open/close raced us while subscribing; our tasks are stale
            fetch_task.abort();
            if let Some(task) = event_task {
                task.abort();
            }
            return Ok(self.inner.snapshot.subscribe());
        }
        st.tasks.push(fetch_task);
        if let Some(task) = event_task {
            st.tasks.push(task);
        }
        st.polling = true;
        st.tasks
            .push(tokio::spawn(self.inner.clone().run_poll_loop(epoch)));

        Ok(self.inner.snapshot.subscribe())
    }

    /// Send a message to the open conversation.
    ///
    /// Blank text is a no-op (no store call). On persist failure nothing
    /// changes locally and the error is returned; there is no automatic
    /// retry. On success the stored message is merged immediately and one
    /// out-of-band poll runs so anything concurrent surfaces without
    /// waiting for the next tick.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            warn!("Ignoring attempt to send an empty message");
            return Ok(());
        }

        let (me, other, epoch) = {
            let st = self.inner.state.lock().await;
            match (&st.me, &st.other) {
                (Some(me), Some(other)) => (me.clone(), other.clone(), st.epoch),
                _ => {
                    warn!("Ignoring send with no open conversation");
                    return Ok(());
                }
            }
        };

        match self.inner.store.create_message(&me, &other, text).await {
            Ok(message) => {
                debug!("Message {} persisted", message.id);
                {
                    let mut st = self.inner.state.lock().await;
                    if st.epoch == epoch && self.inner.merge(&mut st, vec![message], "send") {
                        self.inner.publish(&st);
                    }
                }
                self.inner.poll_once(epoch).await;
                Ok(())
            }
            Err(e) => {
                error!("Failed to send message: {}", e);
                Err(e)
            }
        }
    }

    /// Manual poll trigger (pull-to-refresh)
    pub async fn refresh(&self) {
        let epoch = self.inner.state.lock().await.epoch;
        self.inner.poll_once(epoch).await;
    }

    /// Stop the poll loop doing work (app backgrounded). The subscription
    /// stays attached.
    pub async fn pause_polling(&self) {
        let mut st = self.inner.state.lock().await;
        if st.polling {
            st.polling = false;
            debug!("Polling paused");
        }
    }

    /// Resume the poll loop after [`pause_polling`](Self::pause_polling).
    /// No-op when already active or with no open conversation.
    pub async fn resume_polling(&self) {
        let mut st = self.inner.state.lock().await;
        if st.other.is_some() && !st.polling {
            st.polling = true;
            debug!("Polling resumed");
        }
    }

    /// Close the active conversation: cancel the subscription, stop the
    /// poll loop, clear all state and publish an empty snapshot. Safe to
    /// call repeatedly.
    pub async fn close(&self) {
        let mut st = self.inner.state.lock().await;
        if st.other.is_some() {
            info!("Closing conversation with {}", st.other.as_deref().unwrap_or(""));
        }
        st.teardown();
        self.inner.snapshot.send_replace(Vec::new());
    }

    /// Observable snapshot stream (additional readers beyond the receiver
    /// returned by [`open_conversation`](Self::open_conversation))
    pub fn snapshots(&self) -> watch::Receiver<Vec<Message>> {
        self.inner.snapshot.subscribe()
    }

    /// The counterpart of the open conversation, if any
    pub async fn current_peer(&self) -> Option<String> {
        self.inner.state.lock().await.other.clone()
    }

    /// Whether the poll loop is actively polling
    pub async fn is_polling(&self) -> bool {
        self.inner.state.lock().await.polling
    }

    pub async fn phase(&self) -> Phase {
        self.inner.state.lock().await.phase
    }
}

impl Drop for ChatCoordinator {
    fn drop(&mut self) {
        // Best-effort teardown for owners that forgot to call close()
        if let Ok(mut st) = self.inner.state.try_lock() {
            for task in st.tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Inner {
    /// Initial bulk fetch of conversation history. Success or failure both
    /// move the coordinator to Live; a failed fetch just means starting from
    /// an empty list and letting the poll loop fill it in.
    async fn run_initial_fetch(self: Arc<Self>, key: ConversationKey, epoch: u64) {
        let result = self
            .store
            .query_conversation(&key, None, self.config.initial_fetch_limit)
            .await;

        let mut st = self.state.lock().await;
        if st.epoch != epoch {
            debug!("Discarding initial fetch for stale conversation {}", key.canonical_id());
            return;
        }
        st.phase = Phase::Live;
        match result {
            Ok(messages) => {
                debug!(
                    "Initial fetch for {} returned {} messages",
                    key.canonical_id(),
                    messages.len()
                );
                self.merge(&mut st, messages, "initial fetch");
                self.publish(&st);
            }
            Err(e) => {
                error!("Initial fetch for {} failed: {}", key.canonical_id(), e);
                self.publish(&st);
            }
        }
    }

    /// Consume realtime events until the subscription closes or the
    /// conversation is torn down.
    async fn run_event_loop(self: Arc<Self>, mut sub: Subscription, epoch: u64) {
        while let Some(event) = sub.recv().await {
            let mut st = self.state.lock().await;
            if st.epoch != epoch {
                debug!("Dropping realtime event for stale conversation");
                return;
            }
            self.apply_event(&mut st, event);
        }
        debug!("Realtime subscription closed");
    }

    /// Periodic poll ticks. The flag check and the work share the state
    /// mutex with everything else, so pause/resume need no extra lock.
    async fn run_poll_loop(self: Arc<Self>, epoch: u64) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // An interval's first tick completes immediately; the initial fetch
        // already covers that window
        ticker.tick().await;

        loop {
            ticker.tick().await;
            {
                let st = self.state.lock().await;
                if st.epoch != epoch {
                    return;
                }
                if !st.polling {
                    continue;
                }
            }
            self.poll_once(epoch).await;
        }
    }

    /// One poll pass: fetch everything newer than the high watermark and
    /// merge it. Failures are logged and swallowed; the next tick retries.
    async fn poll_once(&self, epoch: u64) {
        let (key, watermark) = {
            let st = self.state.lock().await;
            if st.epoch != epoch {
                return;
            }
            match &st.key {
                Some(key) => (key.clone(), st.high_watermark),
                None => {
                    debug!("No open conversation to poll");
                    return;
                }
            }
        };

        match self
            .store
            .query_conversation(&key, watermark, self.config.initial_fetch_limit)
            .await
        {
            Ok(messages) if !messages.is_empty() => {
                let mut st = self.state.lock().await;
                if st.epoch != epoch {
                    debug!("Discarding poll result for stale conversation");
                    return;
                }
                if self.merge(&mut st, messages, "poll") {
                    self.publish(&st);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Poll failed, retrying on next tick: {}", e),
        }
    }

    /// Append unseen messages, restore ordering and advance the watermark.
    /// Returns whether anything changed. This is the single reconciliation
    /// point for the initial fetch, poll results and sent messages; the
    /// seen-set makes it safe for realtime and poll to race on the same
    /// message.
    fn merge(&self, st: &mut ConversationState, messages: Vec<Message>, source: &str) -> bool {
        let mut changed = false;
        for message in messages {
            if st.seen.insert(message.id.clone()) {
                debug!("New message {} via {}", message.id, source);
                st.messages.push(message);
                changed = true;
            }
        }
        if changed {
            // Query order should already be ascending, but realtime/poll
            // interleaving can violate strict arrival order
            st.messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            if let Some(last) = st.messages.last() {
                st.high_watermark = Some(match st.high_watermark {
                    Some(current) => current.max(last.created_at),
                    None => last.created_at,
                });
            }
        }
        changed
    }

    fn apply_event(&self, st: &mut ConversationState, event: MessageEvent) {
        match event {
            MessageEvent::Created { message } => {
                if st.seen.contains(&message.id) {
                    debug!("Realtime create for already-seen message {}", message.id);
                    return;
                }
                if self.merge(st, vec![message], "realtime") {
                    self.publish(st);
                }
            }
            MessageEvent::Updated { message } => {
                if let Some(existing) = st.messages.iter_mut().find(|m| m.id == message.id) {
                    debug!("Message {} updated in place", message.id);
                    *existing = message;
                    self.publish(st);
                } else if self.config.resurrect_unknown_updates && !st.seen.contains(&message.id) {
                    // Update raced ahead of its create; treat it as one
                    debug!("Update for unknown message {}, inserting", message.id);
                    if self.merge(st, vec![message], "realtime update") {
                        self.publish(st);
                    }
                } else {
                    debug!("Ignoring update for unknown message {}", message.id);
                }
            }
            MessageEvent::Deleted { message } => {
                if message.id.is_empty() {
                    warn!("Ignoring delete event with empty message id");
                    return;
                }
                let before = st.messages.len();
                st.messages.retain(|m| m.id != message.id);
                if st.messages.len() < before {
                    st.seen.remove(&message.id);
                    debug!("Message {} deleted", message.id);
                    self.publish(st);
                }
            }
        }
    }

    fn publish(&self, st: &ConversationState) {
        self.snapshot.send_replace(st.messages.clone());
    }
}
