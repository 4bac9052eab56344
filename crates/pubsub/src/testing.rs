//! Recording transport and helpers shared by the unit tests.

use crate::codec::Payload;
use crate::error::BoxError;
use crate::options::{Grant, PublishOptions, SubscribeOptions};
use crate::registry::Listener;
use crate::transport::{ConnectionEvent, Transport, TransportError, TransportEvent};

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Error)]
#[error("subscription to '{0}' rejected")]
pub struct Rejected(pub String);

impl TransportError for Rejected {}

pub fn default_options() -> impl Future<Output = Result<SubscribeOptions, BoxError>> + Send {
    async { Ok(SubscribeOptions::default()) }
}

pub fn collecting_listener() -> (Listener, Arc<Mutex<Vec<Payload>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let listener: Listener = Arc::new(move |payload: Payload| sink.lock().push(payload));
    (listener, received)
}

/// Records every call, loops published messages back for subscribed
/// channels, and can park subscribe / unsubscribe calls until released.
pub struct RecordingTransport {
    subscribes: Mutex<Vec<(String, SubscribeOptions)>>,
    unsubscribes: Mutex<Vec<String>>,
    publishes: Mutex<Vec<(String, Bytes, PublishOptions)>>,
    subscribed: Mutex<HashSet<String>>,
    rejected: Mutex<HashSet<String>>,
    subscribe_count: watch::Sender<usize>,
    unsubscribe_count: watch::Sender<usize>,
    subscribe_gate: watch::Sender<bool>,
    unsubscribe_gate: watch::Sender<bool>,
    events: mpsc::UnboundedSender<TransportEvent>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (events, incoming) = mpsc::unbounded_channel();

        Self {
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            publishes: Mutex::new(Vec::new()),
            subscribed: Mutex::new(HashSet::new()),
            rejected: Mutex::new(HashSet::new()),
            subscribe_count: watch::channel(0).0,
            unsubscribe_count: watch::channel(0).0,
            subscribe_gate: watch::channel(false).0,
            unsubscribe_gate: watch::channel(false).0,
            events,
            incoming: Mutex::new(Some(incoming)),
        }
    }

    pub fn reject(&self, channel: &str) {
        self.rejected.lock().insert(channel.to_string());
    }

    pub fn hold_subscribes(&self) {
        self.subscribe_gate.send_replace(true);
    }

    pub fn release_subscribes(&self) {
        self.subscribe_gate.send_replace(false);
    }

    pub fn hold_unsubscribes(&self) {
        self.unsubscribe_gate.send_replace(true);
    }

    pub fn release_unsubscribes(&self) {
        self.unsubscribe_gate.send_replace(false);
    }

    pub async fn wait_for_subscribe_calls(&self, count: usize) {
        let mut calls = self.subscribe_count.subscribe();
        let _ = calls.wait_for(|calls| *calls >= count).await;
    }

    pub async fn wait_for_unsubscribe_calls(&self, count: usize) {
        let mut calls = self.unsubscribe_count.subscribe();
        let _ = calls.wait_for(|calls| *calls >= count).await;
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        self.subscribes
            .lock()
            .iter()
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    pub fn subscribe_options(&self) -> Vec<SubscribeOptions> {
        self.subscribes
            .lock()
            .iter()
            .map(|(_, options)| *options)
            .collect()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.unsubscribes.lock().clone()
    }

    pub fn publish_calls(&self) -> Vec<(String, Bytes, PublishOptions)> {
        self.publishes.lock().clone()
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_connection(&self, event: ConnectionEvent) {
        self.emit(TransportEvent::Connection(event));
    }
}

async fn pass(gate: &watch::Sender<bool>) {
    let mut gate = gate.subscribe();
    let _ = gate.wait_for(|held| !*held).await;
}

#[async_trait]
impl Transport for RecordingTransport {
    type Error = Rejected;

    async fn subscribe(
        &self,
        channel: &str,
        options: SubscribeOptions,
    ) -> Result<Vec<Grant>, Self::Error> {
        self.subscribes.lock().push((channel.to_string(), options));
        self.subscribe_count.send_modify(|calls| *calls += 1);

        pass(&self.subscribe_gate).await;

        if self.rejected.lock().contains(channel) {
            return Err(Rejected(channel.to_string()));
        }

        self.subscribed.lock().insert(channel.to_string());

        Ok(vec![Grant {
            channel: channel.to_string(),
            qos: options.qos,
        }])
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), Self::Error> {
        self.unsubscribes.lock().push(channel.to_string());
        self.unsubscribe_count.send_modify(|calls| *calls += 1);

        pass(&self.unsubscribe_gate).await;

        self.subscribed.lock().remove(channel);

        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), Self::Error> {
        self.publishes
            .lock()
            .push((channel.to_string(), payload.clone(), options));

        if self.subscribed.lock().contains(channel) {
            self.emit(TransportEvent::Message {
                channel: channel.to_string(),
                payload,
            });
        }

        Ok(())
    }

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEvent> + Send>> {
        match self.incoming.lock().take() {
            Some(receiver) => Box::pin(UnboundedReceiverStream::new(receiver)),
            None => Box::pin(futures::stream::empty()),
        }
    }
}
