mod error;

pub use error::Error;

use crate::pattern::{matches, validate_channel, validate_pattern};

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use proven_pubsub::{
    ConnectionEvent, Grant, PublishOptions, QoS, SubscribeOptions, Transport, TransportEvent,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};
use uuid::Uuid;

/// Options for a [`MemoryTransport`] client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryTransportOptions {
    /// Highest delivery quality the broker grants this client.
    pub max_qos: QoS,
}

impl Default for MemoryTransportOptions {
    fn default() -> Self {
        Self {
            max_qos: QoS::ExactlyOnce,
        }
    }
}

#[derive(Debug)]
struct Client {
    /// Subscribed patterns with their granted quality.
    patterns: HashMap<String, QoS>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Client {
    fn deliver(&self, pattern: &str, payload: &Bytes) {
        let _ = self.events.send(TransportEvent::Message {
            channel: pattern.to_string(),
            payload: payload.clone(),
        });
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    clients: HashMap<Uuid, Client>,
    retained: HashMap<String, Bytes>,
}

/// Routes messages between in-process clients.
///
/// A message is delivered once per matching subscription, tagged with the
/// subscribed pattern, so a client holding `comments.*` receives
/// `comments.proven` as a message on `comments.*`.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new client. Its incoming stream starts with
    /// [`ConnectionEvent::Connected`].
    #[must_use]
    pub fn connect(&self, options: MemoryTransportOptions) -> MemoryTransport {
        let id = Uuid::new_v4();
        let (events, incoming) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::Connection(ConnectionEvent::Connected));

        self.state.lock().clients.insert(
            id,
            Client {
                patterns: HashMap::new(),
                events,
            },
        );
        debug!(%id, "memory client connected");

        MemoryTransport {
            id,
            broker: self.clone(),
            options,
            incoming: Mutex::new(Some(incoming)),
        }
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// The retained payload of a channel, if any.
    #[must_use]
    pub fn retained(&self, channel: &str) -> Option<Bytes> {
        self.state.lock().retained.get(channel).cloned()
    }

    fn disconnect(&self, id: Uuid) -> Option<Client> {
        self.state.lock().clients.remove(&id)
    }
}

/// A client of a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryTransport {
    id: Uuid,
    broker: MemoryBroker,
    options: MemoryTransportOptions,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MemoryTransport {
    /// Connects a client with default options to a fresh, private broker.
    #[must_use]
    pub fn new() -> Self {
        MemoryBroker::new().connect(MemoryTransportOptions::default())
    }

    /// The broker this client is connected to.
    #[must_use]
    pub const fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Leaves the broker. The incoming stream yields a final
    /// [`ConnectionEvent::Error`] and ends; later calls fail with
    /// [`Error::Disconnected`].
    pub fn disconnect(&self) {
        if let Some(client) = self.broker.disconnect(self.id) {
            let _ = client.events.send(TransportEvent::Connection(ConnectionEvent::Error(
                "disconnected from broker".to_string(),
            )));
            debug!(id = %self.id, "memory client disconnected");
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.broker.disconnect(self.id);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Error = Error;

    async fn subscribe(
        &self,
        channel: &str,
        options: SubscribeOptions,
    ) -> Result<Vec<Grant>, Error> {
        validate_pattern(channel)?;

        let qos = options.qos.min(self.options.max_qos);

        let mut state = self.broker.state.lock();
        let BrokerState { clients, retained } = &mut *state;
        let client = clients.get_mut(&self.id).ok_or(Error::Disconnected)?;

        client.patterns.insert(channel.to_string(), qos);
        for (retained_channel, payload) in retained.iter() {
            if matches(retained_channel, channel) {
                client.deliver(channel, payload);
            }
        }
        drop(state);

        trace!(id = %self.id, channel, ?qos, "subscribed");

        Ok(vec![Grant {
            channel: channel.to_string(),
            qos,
        }])
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), Error> {
        let mut state = self.broker.state.lock();
        let client = state.clients.get_mut(&self.id).ok_or(Error::Disconnected)?;

        client
            .patterns
            .remove(channel)
            .map(|_| ())
            .ok_or_else(|| Error::NotSubscribed(channel.to_string()))
    }

    async fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), Error> {
        validate_channel(channel)?;

        let mut state = self.broker.state.lock();
        if !state.clients.contains_key(&self.id) {
            return Err(Error::Disconnected);
        }

        if options.retain {
            state.retained.insert(channel.to_string(), payload.clone());
        }

        let mut deliveries = 0;
        for client in state.clients.values() {
            for pattern in client.patterns.keys() {
                if matches(channel, pattern) {
                    client.deliver(pattern, &payload);
                    deliveries += 1;
                }
            }
        }
        drop(state);

        trace!(id = %self.id, channel, deliveries, retain = options.retain, "published");

        Ok(())
    }

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send>> {
        match self.incoming.lock().take() {
            Some(receiver) => Box::pin(UnboundedReceiverStream::new(receiver)),
            None => Box::pin(futures::stream::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use futures::StreamExt;
    use tokio::time::timeout;

    async fn next_event(
        incoming: &mut Pin<Box<dyn Stream<Item = TransportEvent> + Send>>,
    ) -> Option<TransportEvent> {
        timeout(Duration::from_millis(100), incoming.next())
            .await
            .ok()
            .flatten()
    }

    fn message(channel: &str, payload: &'static str) -> TransportEvent {
        TransportEvent::Message {
            channel: channel.to_string(),
            payload: Bytes::from(payload),
        }
    }

    #[tokio::test]
    async fn test_connect_emits_connected() {
        let transport = MemoryTransport::new();
        let mut incoming = transport.incoming();

        assert_eq!(
            next_event(&mut incoming).await,
            Some(TransportEvent::Connection(ConnectionEvent::Connected))
        );
    }

    #[tokio::test]
    async fn test_incoming_can_only_be_taken_once() {
        let transport = MemoryTransport::new();
        let _first = transport.incoming();
        let mut second = transport.incoming();

        assert!(second.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_matching_client() {
        let broker = MemoryBroker::new();
        let alice = broker.connect(MemoryTransportOptions::default());
        let bob = broker.connect(MemoryTransportOptions::default());
        let mut alice_incoming = alice.incoming();
        let mut bob_incoming = bob.incoming();
        next_event(&mut alice_incoming).await;
        next_event(&mut bob_incoming).await;

        alice
            .subscribe("comments.proven", SubscribeOptions::default())
            .await
            .unwrap();
        bob.subscribe("comments.*", SubscribeOptions::default())
            .await
            .unwrap();

        bob.publish("comments.proven", Bytes::from("hi"), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut alice_incoming).await,
            Some(message("comments.proven", "hi"))
        );
        assert_eq!(
            next_event(&mut bob_incoming).await,
            Some(message("comments.*", "hi"))
        );
    }

    #[tokio::test]
    async fn test_one_delivery_per_matching_subscription() {
        let transport = MemoryTransport::new();
        let mut incoming = transport.incoming();
        next_event(&mut incoming).await;

        transport
            .subscribe("a.b", SubscribeOptions::default())
            .await
            .unwrap();
        transport
            .subscribe("a.>", SubscribeOptions::default())
            .await
            .unwrap();

        transport
            .publish("a.b", Bytes::from("x"), PublishOptions::default())
            .await
            .unwrap();

        let mut channels = vec![];
        while let Some(TransportEvent::Message { channel, .. }) = next_event(&mut incoming).await {
            channels.push(channel);
        }
        channels.sort();

        assert_eq!(channels, vec!["a.>".to_string(), "a.b".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribed_channel_receives_nothing() {
        let transport = MemoryTransport::new();
        let mut incoming = transport.incoming();
        next_event(&mut incoming).await;

        transport
            .subscribe("test", SubscribeOptions::default())
            .await
            .unwrap();
        transport.unsubscribe("test").await.unwrap();
        transport
            .publish("test", Bytes::from("x"), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(next_event(&mut incoming).await, None);
        assert_matches!(
            transport.unsubscribe("test").await,
            Err(Error::NotSubscribed(channel)) if channel == "test"
        );
    }

    #[tokio::test]
    async fn test_qos_is_capped() {
        let broker = MemoryBroker::new();
        let transport = broker.connect(MemoryTransportOptions {
            max_qos: QoS::AtLeastOnce,
        });

        let grants = transport
            .subscribe(
                "test",
                SubscribeOptions {
                    qos: QoS::ExactlyOnce,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            grants,
            vec![Grant {
                channel: "test".to_string(),
                qos: QoS::AtLeastOnce
            }]
        );
    }

    #[tokio::test]
    async fn test_retained_message_delivered_on_subscribe() {
        let broker = MemoryBroker::new();
        let publisher = broker.connect(MemoryTransportOptions::default());
        let subscriber = broker.connect(MemoryTransportOptions::default());
        let mut incoming = subscriber.incoming();
        next_event(&mut incoming).await;

        publisher
            .publish(
                "status.node1",
                Bytes::from("up"),
                PublishOptions {
                    qos: QoS::AtMostOnce,
                    retain: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(broker.retained("status.node1"), Some(Bytes::from("up")));

        subscriber
            .subscribe("status.*", SubscribeOptions::default())
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut incoming).await,
            Some(message("status.*", "up"))
        );
    }

    #[tokio::test]
    async fn test_invalid_channels_rejected() {
        let transport = MemoryTransport::new();

        assert_matches!(
            transport.subscribe("a..b", SubscribeOptions::default()).await,
            Err(Error::InvalidChannel(_))
        );
        assert_matches!(
            transport
                .publish("a.*", Bytes::new(), PublishOptions::default())
                .await,
            Err(Error::WildcardPublish(_))
        );
    }

    #[tokio::test]
    async fn test_disconnect() {
        let broker = MemoryBroker::new();
        let transport = broker.connect(MemoryTransportOptions::default());
        let mut incoming = transport.incoming();
        next_event(&mut incoming).await;
        assert_eq!(broker.client_count(), 1);

        transport.disconnect();

        assert_eq!(broker.client_count(), 0);
        assert_matches!(
            next_event(&mut incoming).await,
            Some(TransportEvent::Connection(ConnectionEvent::Error(_)))
        );
        assert_eq!(next_event(&mut incoming).await, None);
        assert_matches!(
            transport.subscribe("test", SubscribeOptions::default()).await,
            Err(Error::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_drop_leaves_broker() {
        let broker = MemoryBroker::new();
        let transport = broker.connect(MemoryTransportOptions::default());
        assert_eq!(broker.client_count(), 1);

        drop(transport);

        assert_eq!(broker.client_count(), 0);
    }
}
