use proven_pubsub::TransportError;
use thiserror::Error;

/// Errors returned by the in-memory transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The channel (or pattern) is empty, has empty tokens, or misuses wildcards.
    #[error("invalid channel '{0}'")]
    InvalidChannel(String),

    /// Publishing is only allowed on concrete channels.
    #[error("cannot publish to wildcard channel '{0}'")]
    WildcardPublish(String),

    /// No subscription exists for the channel.
    #[error("not subscribed to '{0}'")]
    NotSubscribed(String),

    /// The client has been disconnected from its broker.
    #[error("client is disconnected")]
    Disconnected,
}

impl TransportError for Error {}
