//! Notification channels.
//!
//! Two topics feed every session of a user: the direct broadcast topic that
//! sessions publish to after their own writes, and the table-wide change
//! feed emitted for each durable write. Delivery on both is at-least-once
//! from the receiver's point of view once the two overlap, so consumers must
//! apply events idempotently.
//!
//! [`LocalHub`] carries both topics inside one process, with the embedded
//! store producing the change feed. [`SocketTransport`] carries them over
//! the hosted backend's realtime websocket, where the backend produces it.

use tokio::sync::broadcast;

use crate::types::errors::ChannelError;
use crate::types::events::Envelope;

pub mod hub;
pub mod reconnect;
pub mod socket;
pub mod topics;

pub use hub::LocalHub;
pub use reconnect::ReconnectPolicy;
pub use socket::{SocketConfig, SocketTransport};

/// Publish/subscribe transport carrying [`Envelope`]s by topic name.
pub trait RealtimeTransport: Send + Sync {
    /// Opens a subscription on `topic`, creating the topic if needed.
    fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Envelope>, ChannelError>;

    /// Publishes to every current subscriber of `topic`.
    ///
    /// Returns the number of receivers reached. Subscribers that join later
    /// never see the envelope.
    fn publish(&self, topic: &str, envelope: Envelope) -> Result<usize, ChannelError>;

    /// Releases server-side resources for `topic` once nobody listens to it.
    fn release(&self, topic: &str);
}
