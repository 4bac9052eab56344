use crate::registry::ListenerId;

use thiserror::Error;

/// Boxed error returned by user-supplied option resolvers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for pubsub operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the registry, the iterator bridge and the facade.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The listener identity is not (or no longer) registered.
    #[error("there is no subscription of id \"{0}\"")]
    UnknownSubscription(ListenerId),

    /// The transport, or the subscribe options resolver, rejected a subscription.
    #[error("failed to subscribe to '{channel}': {reason}")]
    Subscribe {
        /// Channel the subscription was for.
        channel: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The pubsub instance has been shut down.
    #[error("pubsub has been shut down")]
    Closed,

    /// Error injected into an iterator by its consumer.
    #[error("consumer error: {0}")]
    Consumer(String),
}
