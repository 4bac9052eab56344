use crate::options::{Grant, PublishOptions, SubscribeOptions};

use std::error::Error;
use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// Marker trait for transport errors
pub trait TransportError: Debug + Error + Send + Sync + 'static {}

/// Connection lifecycle notifications, passed through to the configured listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The transport (re)connected to its broker.
    Connected,

    /// The transport reported an error.
    Error(String),
}

/// Everything a transport pushes towards the pubsub layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message arrived on a channel this client is subscribed to.
    Message {
        /// Channel the message was published on.
        channel: String,
        /// Encoded payload.
        payload: Bytes,
    },

    /// A connection lifecycle notification.
    Connection(ConnectionEvent),
}

/// A topic-addressed messaging client shared by every channel of a registry.
///
/// The registry is the only caller of `subscribe` and `unsubscribe`, and never
/// has two of those calls in flight for the same channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The error type for the transport.
    type Error: TransportError;

    /// Subscribes to a channel, returning the parameters the broker granted.
    async fn subscribe(
        &self,
        channel: &str,
        options: SubscribeOptions,
    ) -> Result<Vec<Grant>, Self::Error>;

    /// Drops the subscription to a channel.
    async fn unsubscribe(&self, channel: &str) -> Result<(), Self::Error>;

    /// Publishes an encoded payload to a channel.
    async fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), Self::Error>;

    /// Stream of incoming messages and connection events, in delivery order.
    ///
    /// Only meant to be consumed once; the pubsub facade takes it on construction.
    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;
}
