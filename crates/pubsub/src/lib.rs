//! Fan-out / fan-in coordination between many logical subscribers and a
//! single topic-addressed transport.
//!
//! Listeners register interest in channels through a reference-counted
//! [`SubscriptionRegistry`], which keeps at most one transport subscription
//! per channel and dispatches every arriving message to all listeners of that
//! channel. [`SubscriptionIterator`] turns that push delivery into pull-based
//! consumption. [`PubSub`] wires both to a concrete [`Transport`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod codec;
mod error;
mod iterator;
mod options;
mod pubsub;
mod registry;
mod transport;
mod trigger;

#[cfg(test)]
mod testing;

pub use codec::{Payload, PayloadCodec, PayloadEncoding};
pub use error::{BoxError, Error, Result};
pub use iterator::SubscriptionIterator;
pub use options::{
    ConnectionListener, Grant, PubSubOptions, PublishOptions, PublishOptionsResolver, QoS,
    SubscribeHook, SubscribeOptions, SubscribeOptionsResolver,
};
pub use pubsub::PubSub;
pub use registry::{Listener, ListenerId, SubscriptionRegistry};
pub use transport::{ConnectionEvent, Transport, TransportError, TransportEvent};
pub use trigger::{TriggerTransform, Triggers};
