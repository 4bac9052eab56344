//! In-process transport for the pubsub crate.
//!
//! A [`MemoryBroker`] routes messages between any number of connected
//! [`MemoryTransport`] clients. Channels are dot-separated tokens;
//! subscriptions may use NATS-style wildcards (`*` for one token, `>` for the
//! remainder).
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod pattern;
mod transport;

pub use transport::{Error, MemoryBroker, MemoryTransport, MemoryTransportOptions};
