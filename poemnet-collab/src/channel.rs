//! Per-poem pub/sub channels with fan-out to all subscribers.
//!
//! A [`ChannelHandle`] is a named topic backed by a tokio broadcast
//! channel; frames are pre-serialized JSON shared as `Arc<str>` so a
//! publish is O(1) regardless of subscriber count. Delivery is
//! at-most-once: lagging receivers drop frames, and no acks are kept.
//!
//! The [`ChannelRegistry`] caches handles by name for the lifetime of
//! whoever owns it. Entries are never evicted; a session tears down
//! its *subscription* on close, not the channel, which avoids reconnect
//! churn when the same poem is reopened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::message::CollaborationMessage;

/// Channel name for a poem's editing session.
pub fn poem_channel_name(poem_id: Uuid) -> String {
    format!("poem:{poem_id}")
}

/// Transport-level channel failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The frame could not be put on the wire. Never retried here;
    /// retry policy belongs to the caller.
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Snapshot of one channel's counters.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub messages_published: u64,
    pub subscriber_count: usize,
}

/// Lock-free counters so publish never takes a lock.
struct AtomicChannelStats {
    messages_published: AtomicU64,
}

/// A named pub/sub topic for one poem.
pub struct ChannelHandle {
    name: String,
    sender: broadcast::Sender<Arc<str>>,
    capacity: usize,
    stats: AtomicChannelStats,
}

impl ChannelHandle {
    /// Create a standalone channel with the given per-receiver buffer
    /// capacity. Normally obtained via [`ChannelRegistry::acquire`].
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            capacity,
            stats: AtomicChannelStats {
                messages_published: AtomicU64::new(0),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish one message to every current subscriber.
    ///
    /// Fire-and-forget: returns the number of receivers the frame was
    /// handed to, which says nothing about remote receipt. Zero
    /// subscribers is success.
    pub fn publish(&self, msg: &CollaborationMessage) -> Result<usize, ChannelError> {
        let frame: Arc<str> = msg
            .to_json()
            .map_err(|e| ChannelError::Publish(e.to_string()))?
            .into();
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Publish a pre-serialized frame (zero-copy fast path).
    pub fn publish_raw(&self, frame: Arc<str>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Begin receiving messages, invoking `on_message` per decoded
    /// frame. Returns a disposer; delivery stops when it is dropped or
    /// [`Subscription::dispose`]d.
    ///
    /// Frames that fail to decode are logged and skipped; a bad frame
    /// never tears down the subscription.
    pub fn subscribe<F>(&self, mut on_message: F) -> Subscription
    where
        F: FnMut(CollaborationMessage) + Send + 'static,
    {
        let mut rx = self.sender.subscribe();
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => match serde_json::from_str::<CollaborationMessage>(&frame) {
                        Ok(msg) => on_message(msg),
                        Err(e) => log::warn!("channel {name}: dropping undecodable frame: {e}"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("channel {name}: subscriber lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    /// Raw frame receiver for select-loop consumers.
    pub fn receiver(&self) -> broadcast::Receiver<Arc<str>> {
        self.sender.subscribe()
    }

    /// Current number of attached receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            subscriber_count: self.sender.receiver_count(),
        }
    }
}

/// Scoped acquisition of a channel subscription.
///
/// Dropping it (or calling [`dispose`](Self::dispose)) stops delivery;
/// the channel itself stays alive in the registry.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop receiving. Idempotent with drop.
    pub fn dispose(self) {
        self.task.abort();
    }

    /// Whether the delivery task is still running.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Keyed cache of channel handles, shared by every editing session in
/// the process.
///
/// Owned explicitly by the application context and passed down, not a
/// hidden global. Entries live as long as the registry does; visiting
/// many distinct poems in one session grows it monotonically.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<ChannelHandle>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get the handle for a named channel, creating it on first use.
    /// The same name always yields the same handle.
    pub async fn acquire(&self, name: &str) -> Arc<ChannelHandle> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(handle) = channels.get(name) {
                return handle.clone();
            }
        }

        // Slow path: write lock, double-checked
        let mut channels = self.channels.write().await;
        if let Some(handle) = channels.get(name) {
            return handle.clone();
        }
        let handle = Arc::new(ChannelHandle::new(name, self.default_capacity));
        channels.insert(name.to_string(), handle.clone());
        handle
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}
