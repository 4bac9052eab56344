//! Reference-counted subscription registry.
//!
//! Keeps at most one transport subscription per channel no matter how many
//! listeners are registered on it, and fans every arriving message out to the
//! channel's listeners in registration order.
//!
//! Transport subscribe / unsubscribe calls for a channel are serialized: while
//! one is in flight the channel is "in transition", and any `add` for it waits
//! for the transition to settle before deciding what to do.

use crate::codec::{Payload, PayloadCodec};
use crate::error::{BoxError, Error, Result};
use crate::options::{Grant, SubscribeHook, SubscribeOptions};
use crate::transport::Transport;

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

/// Callback invoked with every payload dispatched to its channel.
pub type Listener = Arc<dyn Fn(Payload) + Send + Sync>;

/// Opaque handle for a registered listener. Never reused within a registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Wraps a raw identity.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identity.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// `None` until the transition settles.
type TransitionOutcome = Option<Result<()>>;

struct ListenerEntry {
    channel: String,
    listener: Listener,
}

#[derive(Default)]
struct State {
    next_id: u64,

    /// Channels with a live transport subscription -> listeners in registration order.
    channels: HashMap<String, IndexSet<ListenerId>>,

    /// Listener -> its channel and callback.
    listeners: HashMap<ListenerId, ListenerEntry>,

    /// Channels with a transport subscribe or unsubscribe in flight.
    /// Never overlaps with `channels`.
    transitions: HashMap<String, watch::Receiver<TransitionOutcome>>,
}

impl State {
    fn register(&mut self, channel: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;

        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        self.listeners.insert(
            id,
            ListenerEntry {
                channel: channel.to_string(),
                listener,
            },
        );

        id
    }

    fn begin_transition(&mut self, channel: &str) -> watch::Sender<TransitionOutcome> {
        let (signal, receiver) = watch::channel(None);
        self.transitions.insert(channel.to_string(), receiver);
        signal
    }
}

/// An in-flight transport operation on one channel.
///
/// Settling it removes the channel's transition marker and wakes every `add`
/// waiting on it. Dropping it unsettled (the owning future was cancelled)
/// only removes the marker; waiters then retry from scratch.
struct Transition<'a, T>
where
    T: Transport,
{
    registry: &'a SubscriptionRegistry<T>,
    channel: String,
    signal: Option<watch::Sender<TransitionOutcome>>,
}

impl<'a, T> Transition<'a, T>
where
    T: Transport,
{
    const fn new(
        registry: &'a SubscriptionRegistry<T>,
        channel: String,
        signal: watch::Sender<TransitionOutcome>,
    ) -> Self {
        Self {
            registry,
            channel,
            signal: Some(signal),
        }
    }

    /// Applies `update` and clears the transition under the same lock, then
    /// publishes `outcome` to waiters.
    fn settle<R>(mut self, outcome: Result<()>, update: impl FnOnce(&mut State) -> R) -> R {
        let result = {
            let mut state = self.registry.state.lock();
            state.transitions.remove(&self.channel);
            update(&mut state)
        };

        if let Some(signal) = self.signal.take() {
            // No receivers left just means nobody was waiting.
            let _ = signal.send(Some(outcome));
        }

        result
    }
}

impl<T> Drop for Transition<'_, T>
where
    T: Transport,
{
    fn drop(&mut self) {
        if self.signal.take().is_some() {
            debug!(channel = %self.channel, "transition abandoned before settling");
            self.registry.state.lock().transitions.remove(&self.channel);
        }
    }
}

enum Step<'a, T>
where
    T: Transport,
{
    Wait(watch::Receiver<TransitionOutcome>),
    Subscribe(Transition<'a, T>),
}

/// Maps channels to listeners and owns every transport subscribe / unsubscribe.
pub struct SubscriptionRegistry<T>
where
    T: Transport,
{
    transport: Arc<T>,
    codec: PayloadCodec,
    on_subscribe: SubscribeHook,
    state: Mutex<State>,
}

impl<T> Debug for SubscriptionRegistry<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("codec", &self.codec)
            .field("channels", &state.channels.len())
            .field("listeners", &state.listeners.len())
            .field("transitions", &state.transitions.len())
            .finish_non_exhaustive()
    }
}

impl<T> SubscriptionRegistry<T>
where
    T: Transport,
{
    /// Creates an empty registry over a shared transport.
    pub fn new(transport: Arc<T>, codec: PayloadCodec, on_subscribe: SubscribeHook) -> Self {
        Self {
            transport,
            codec,
            on_subscribe,
            state: Mutex::new(State::default()),
        }
    }

    /// Registers `listener` on `channel`.
    ///
    /// The first listener of a channel waits for the transport subscription
    /// (using the options produced by `options`) before its identity is
    /// issued. Later listeners reuse that subscription and return
    /// immediately; `options` is then never polled.
    ///
    /// # Errors
    /// Returns [`Error::Subscribe`] if the options resolver or the transport
    /// rejects the subscription. Nothing is registered in that case, and every
    /// concurrent `add` waiting on the same subscription fails too.
    pub async fn add<F>(&self, channel: &str, listener: Listener, options: F) -> Result<ListenerId>
    where
        F: Future<Output = std::result::Result<SubscribeOptions, BoxError>> + Send,
    {
        let mut options = Some(options);

        loop {
            let step = {
                let mut state = self.state.lock();

                if state.channels.contains_key(channel) {
                    let id = state.register(channel, listener);
                    trace!(%id, channel, "listener added to existing channel");
                    return Ok(id);
                }

                match state.transitions.get(channel) {
                    Some(receiver) => Step::Wait(receiver.clone()),
                    None => {
                        let signal = state.begin_transition(channel);
                        Step::Subscribe(Transition::new(self, channel.to_string(), signal))
                    }
                }
            };

            match step {
                Step::Wait(mut receiver) => {
                    trace!(channel, "waiting for channel transition");
                    let outcome = match receiver.wait_for(Option::is_some).await {
                        Ok(outcome) => (*outcome).clone(),
                        Err(_) => None,
                    };

                    // A failed subscribe is shared with everyone who queued on it.
                    if let Some(Err(error)) = outcome {
                        return Err(error);
                    }
                }
                Step::Subscribe(transition) => {
                    let grants = match self.subscribe_transport(channel, options.take()).await {
                        Ok(grants) => grants,
                        Err(error) => {
                            warn!(channel, %error, "transport subscribe failed");
                            transition.settle(Err(error.clone()), |_| ());
                            return Err(error);
                        }
                    };

                    let id = transition.settle(Ok(()), |state| state.register(channel, listener));
                    debug!(%id, channel, ?grants, "transport subscription established");

                    (self.on_subscribe)(id, grants.as_slice());

                    return Ok(id);
                }
            }
        }
    }

    async fn subscribe_transport<F>(&self, channel: &str, options: Option<F>) -> Result<Vec<Grant>>
    where
        F: Future<Output = std::result::Result<SubscribeOptions, BoxError>> + Send,
    {
        let rejected = |reason: String| Error::Subscribe {
            channel: channel.to_string(),
            reason,
        };

        let options = match options {
            Some(options) => options.await.map_err(|e| rejected(e.to_string()))?,
            None => SubscribeOptions::default(),
        };

        self.transport
            .subscribe(channel, options)
            .await
            .map_err(|e| rejected(e.to_string()))
    }

    /// Removes a listener. Removing the last listener of a channel drops the
    /// transport subscription; transport failures there are logged only.
    ///
    /// # Errors
    /// Returns [`Error::UnknownSubscription`] if `id` is not registered.
    pub async fn remove(&self, id: ListenerId) -> Result<()> {
        let transition = {
            let mut state = self.state.lock();

            let entry = state
                .listeners
                .remove(&id)
                .ok_or(Error::UnknownSubscription(id))?;

            let Some(ids) = state.channels.get_mut(&entry.channel) else {
                return Ok(());
            };

            ids.shift_remove(&id);
            trace!(%id, channel = %entry.channel, remaining = ids.len(), "listener removed");

            if !ids.is_empty() {
                return Ok(());
            }

            state.channels.remove(&entry.channel);
            let signal = state.begin_transition(&entry.channel);
            Transition::new(self, entry.channel, signal)
        };

        if let Err(error) = self.transport.unsubscribe(&transition.channel).await {
            warn!(channel = %transition.channel, %error, "transport unsubscribe failed");
        } else {
            debug!(channel = %transition.channel, "transport subscription dropped");
        }

        transition.settle(Ok(()), |_| ());

        Ok(())
    }

    /// Decodes `payload` once and hands it to every listener currently
    /// registered on `channel`, in registration order. Returns how many
    /// listeners were invoked.
    ///
    /// Messages for channels without listeners are ignored. A panicking
    /// listener is logged and does not stop delivery to the others. A
    /// listener removed by an earlier listener of the same dispatch is
    /// skipped; one added during the dispatch only sees later messages.
    pub fn dispatch(&self, channel: &str, payload: &Bytes) -> usize {
        // Snapshot so listeners can (un)subscribe from inside their callback.
        let listeners: Vec<(ListenerId, Listener)> = {
            let state = self.state.lock();
            let Some(ids) = state.channels.get(channel) else {
                trace!(channel, "no listeners for channel");
                return 0;
            };

            ids.iter()
                .filter_map(|id| {
                    state
                        .listeners
                        .get(id)
                        .map(|entry| (*id, entry.listener.clone()))
                })
                .collect()
        };

        if listeners.is_empty() {
            return 0;
        }

        let payload = self.codec.decode(payload);
        let mut invoked = 0;

        for (id, listener) in &listeners {
            // Removed by an earlier listener of this same dispatch.
            if !self.is_registered(*id) {
                trace!(%id, channel, "skipping listener removed during dispatch");
                continue;
            }

            let delivery = payload.clone();
            if catch_unwind(AssertUnwindSafe(|| listener(delivery))).is_err() {
                error!(%id, channel, "listener panicked during dispatch");
            }
            invoked += 1;
        }

        invoked
    }

    /// Returns whether `id` is currently registered.
    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.state.lock().listeners.contains_key(&id)
    }

    /// Number of listeners registered on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel)
            .map_or(0, IndexSet::len)
    }

    /// Channels that currently hold a transport subscription.
    pub fn channels(&self) -> Vec<String> {
        self.state.lock().channels.keys().cloned().collect()
    }
}
