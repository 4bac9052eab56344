use crate::codec::{Payload, PayloadCodec};
use crate::error::{Error, Result};
use crate::iterator::SubscriptionIterator;
use crate::options::{ConnectionListener, PubSubOptions, PublishOptionsResolver};
use crate::registry::{ListenerId, SubscriptionRegistry};
use crate::transport::{ConnectionEvent, Transport, TransportEvent};
use crate::trigger::Triggers;

use std::fmt::{self, Debug};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, trace, warn};

struct PendingPublish {
    trigger: String,
    payload: Value,
}

/// Publish/subscribe engine over a single [`Transport`].
///
/// Publishing is fire-and-forget: values are queued and handed to the
/// transport in call order by a background task. Subscriptions are
/// reference-counted per channel by the underlying [`SubscriptionRegistry`].
///
/// Must be created inside a Tokio runtime.
pub struct PubSub<T>
where
    T: Transport,
{
    transport: Arc<T>,
    registry: Arc<SubscriptionRegistry<T>>,
    options: PubSubOptions,
    publisher: Mutex<Option<mpsc::UnboundedSender<PendingPublish>>>,
    publisher_task: Mutex<Option<JoinHandle<()>>>,
    delivery_task: JoinHandle<()>,
    /// Flips to `true` once; iterators watch it to end their pulls.
    shutdown: watch::Sender<bool>,
}

impl<T> Debug for PubSub<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSub")
            .field("options", &self.options)
            .field("channels", &self.registry.channels())
            .field("closed", &*self.shutdown.borrow())
            .finish_non_exhaustive()
    }
}

impl<T> PubSub<T>
where
    T: Transport,
{
    /// Creates an engine over `transport` and starts consuming its incoming
    /// stream.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn new(transport: Arc<T>, options: PubSubOptions) -> Self {
        let codec = options.codec();
        let registry = Arc::new(SubscriptionRegistry::new(
            transport.clone(),
            codec,
            options.on_subscribe.clone(),
        ));

        let delivery_task = tokio::spawn(deliver(
            transport.incoming(),
            registry.clone(),
            options.connection_listener.clone(),
        )
        .in_current_span());

        let (publisher, queue) = mpsc::unbounded_channel();
        let publisher_task = tokio::spawn(publish_queued(
            transport.clone(),
            codec,
            options.publish_options.clone(),
            queue,
        )
        .in_current_span());

        Self {
            transport,
            registry,
            options,
            publisher: Mutex::new(Some(publisher)),
            publisher_task: Mutex::new(Some(publisher_task)),
            delivery_task,
            shutdown: watch::channel(false).0,
        }
    }

    /// Queues `payload` for publication on `trigger`.
    ///
    /// The trigger is used as the channel name as-is; the trigger transform
    /// only applies to subscriptions. Returns `true` once the value is
    /// queued. Transport failures surface only in the logs.
    ///
    /// Returns `false` if the payload cannot be serialized or the engine has
    /// been shut down.
    pub fn publish<P>(&self, trigger: &str, payload: &P) -> bool
    where
        P: Serialize + ?Sized,
    {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(trigger, %error, "payload is not serializable");
                return false;
            }
        };

        let publisher = self.publisher.lock();
        let Some(publisher) = publisher.as_ref() else {
            debug!(trigger, "publish after shutdown ignored");
            return false;
        };

        publisher
            .send(PendingPublish {
                trigger: trigger.to_string(),
                payload,
            })
            .is_ok()
    }

    /// Registers `callback` for every value delivered on the channel that
    /// `trigger` (and `context`) resolve to.
    ///
    /// # Errors
    /// Returns [`Error::Subscribe`] if the transport or the subscribe options
    /// resolver rejects the subscription, and [`Error::Closed`] after
    /// [`shutdown`](Self::shutdown).
    pub async fn subscribe<F>(
        &self,
        trigger: &str,
        callback: F,
        context: Option<Value>,
    ) -> Result<ListenerId>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        if *self.shutdown.borrow() {
            return Err(Error::Closed);
        }

        let channel = (self.options.trigger_transform)(trigger, context.as_ref());
        let options = (self.options.subscribe_options)(trigger, context.as_ref());

        self.registry
            .add(&channel, Arc::new(callback), options)
            .await
    }

    /// Removes a listener previously returned by [`subscribe`](Self::subscribe).
    ///
    /// # Errors
    /// Returns [`Error::UnknownSubscription`] if `id` is not registered.
    pub async fn unsubscribe(&self, id: ListenerId) -> Result<()> {
        self.registry.remove(id).await
    }

    /// Creates a pull-based iterator over one or more triggers.
    ///
    /// The iterator ends when the engine shuts down; its first pull after
    /// shutdown fails with [`Error::Closed`].
    pub fn async_iterator(&self, triggers: impl Into<Triggers>) -> SubscriptionIterator<T> {
        self.iterator(&triggers.into(), None)
    }

    /// Like [`async_iterator`](Self::async_iterator), with a context passed
    /// to the trigger transform and the subscribe options resolver.
    pub fn async_iterator_with_context(
        &self,
        triggers: impl Into<Triggers>,
        context: Value,
    ) -> SubscriptionIterator<T> {
        self.iterator(&triggers.into(), Some(context))
    }

    fn iterator(&self, triggers: &Triggers, context: Option<Value>) -> SubscriptionIterator<T> {
        SubscriptionIterator::new(
            self.registry.clone(),
            triggers,
            &self.options.trigger_transform,
            self.options.subscribe_options.clone(),
            context,
            self.shutdown.subscribe(),
        )
    }

    /// Number of listeners registered on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.registry.listener_count(channel)
    }

    /// The underlying registry.
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry<T>> {
        &self.registry
    }

    /// The underlying transport.
    pub const fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Stops accepting publishes and subscriptions, flushes queued publishes
    /// and stops delivery. Pending iterator pulls end and the iterators
    /// unregister; other subscriptions are left with the transport.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }

        drop(self.publisher.lock().take());

        let publisher_task = self.publisher_task.lock().take();
        if let Some(publisher_task) = publisher_task {
            if let Err(error) = publisher_task.await {
                error!(%error, "publisher task failed");
            }
        }

        self.delivery_task.abort();
        info!("pubsub shut down");
    }
}

impl<T> Drop for PubSub<T>
where
    T: Transport,
{
    fn drop(&mut self) {
        self.delivery_task.abort();
    }
}

async fn deliver<T>(
    mut incoming: impl Stream<Item = TransportEvent> + Unpin,
    registry: Arc<SubscriptionRegistry<T>>,
    connection_listener: Option<ConnectionListener>,
) where
    T: Transport,
{
    while let Some(event) = incoming.next().await {
        match event {
            TransportEvent::Message { channel, payload } => {
                let delivered = registry.dispatch(&channel, &payload);
                trace!(channel, delivered, "message dispatched");
            }
            TransportEvent::Connection(event) => match &connection_listener {
                Some(listener) => listener(&event),
                None => match event {
                    ConnectionEvent::Connected => info!("transport connected"),
                    ConnectionEvent::Error(error) => error!(%error, "transport error"),
                },
            },
        }
    }

    debug!("transport incoming stream ended");
}

async fn publish_queued<T>(
    transport: Arc<T>,
    codec: PayloadCodec,
    resolver: PublishOptionsResolver,
    mut queue: mpsc::UnboundedReceiver<PendingPublish>,
) where
    T: Transport,
{
    while let Some(PendingPublish { trigger, payload }) = queue.recv().await {
        let options = match resolver(&trigger, &payload).await {
            Ok(options) => options,
            Err(error) => {
                warn!(trigger, %error, "failed to resolve publish options, dropping message");
                continue;
            }
        };

        if let Err(error) = transport
            .publish(&trigger, codec.encode(&payload), options)
            .await
        {
            warn!(trigger, %error, "failed to publish");
        }
    }
}
