//! In-process realtime hub.
//!
//! Every session hosted by the same process (one per open tab or window)
//! subscribes through a shared `LocalHub`. Each topic is a bounded
//! `tokio::sync::broadcast` channel; a receiver that falls more than
//! `capacity` envelopes behind observes `RecvError::Lagged`.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::RealtimeTransport;
use crate::types::errors::ChannelError;
use crate::types::events::Envelope;

/// Topic registry backed by broadcast channels.
pub struct LocalHub {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of topics currently held open.
    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }

    /// Drops a topic regardless of subscribers. Their receivers see
    /// `RecvError::Closed` once drained.
    pub fn shutdown_topic(&self, topic: &str) {
        if self.lock().remove(topic).is_some() {
            debug!(topic, "topic shut down");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<Envelope>>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl RealtimeTransport for LocalHub {
    fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Envelope>, ChannelError> {
        let mut topics = self.lock();
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        debug!(topic, subscribers = sender.receiver_count() + 1, "subscribed");
        Ok(sender.subscribe())
    }

    fn publish(&self, topic: &str, envelope: Envelope) -> Result<usize, ChannelError> {
        let topics = self.lock();
        let sender = topics
            .get(topic)
            .ok_or_else(|| ChannelError::NoSubscribers(topic.to_string()))?;
        let reached = sender
            .send(envelope)
            .map_err(|_| ChannelError::NoSubscribers(topic.to_string()))?;
        trace!(topic, reached, "published");
        Ok(reached)
    }

    fn release(&self, topic: &str) {
        let mut topics = self.lock();
        if topics.get(topic).is_some_and(|s| s.receiver_count() == 0) {
            topics.remove(topic);
            debug!(topic, "topic released");
        }
    }
}
