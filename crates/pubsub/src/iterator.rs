//! Pull-based consumption of push-delivered channels.
//!
//! A [`SubscriptionIterator`] holds two queues of which at most one is ever
//! non-empty: values that arrived before anybody asked for them, and pulls
//! that are waiting for a value. Registration with the registry is deferred
//! to the first pull.

use crate::codec::Payload;
use crate::error::{Error, Result};
use crate::options::SubscribeOptionsResolver;
use crate::registry::{Listener, ListenerId, SubscriptionRegistry};
use crate::transport::Transport;
use crate::trigger::{TriggerTransform, Triggers};

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use futures::Stream;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{OnceCell, oneshot, watch};
use tracing::{Instrument, debug, warn};

type Pull = oneshot::Sender<Result<Option<Payload>>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Phase {
    /// Nothing registered yet.
    #[default]
    Idle,

    /// Listeners registered on every channel.
    Listening,

    /// Closed; every pull yields the end marker.
    Terminated,
}

#[derive(Default)]
struct BridgeState {
    phase: Phase,
    pending_values: VecDeque<Payload>,
    pending_pulls: VecDeque<Pull>,
    /// Registered listeners by channel, recorded as each registration lands.
    listeners: IndexMap<String, ListenerId>,
}

impl BridgeState {
    fn take_listeners(&mut self) -> Vec<ListenerId> {
        std::mem::take(&mut self.listeners).into_values().collect()
    }
}

struct Inner<T>
where
    T: Transport,
{
    registry: Arc<SubscriptionRegistry<T>>,
    /// `(trigger, channel)` pairs, resolved once at construction.
    channels: Vec<(String, String)>,
    context: Option<Value>,
    subscribe_options: SubscribeOptionsResolver,
    registration: OnceCell<Result<()>>,
    shutdown: watch::Receiver<bool>,
    state: Mutex<BridgeState>,
}

impl<T> Inner<T>
where
    T: Transport,
{
    /// Registers one listener per channel not registered yet, all at once.
    ///
    /// Each identity is recorded the moment its registration completes, so a
    /// cancelled run leaves nothing untracked and a later run only covers the
    /// remaining channels.
    async fn listen(self: Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(&self);

        let remaining: Vec<&(String, String)> = {
            let state = self.state.lock();
            self.channels
                .iter()
                .filter(|(_, channel)| !state.listeners.contains_key(channel))
                .collect()
        };

        let inner = &self;
        let registrations = remaining.into_iter().map(|(trigger, channel)| {
            let listener = push_listener(weak.clone());
            let options = (inner.subscribe_options)(trigger, inner.context.as_ref());
            async move {
                let id = inner.registry.add(channel, listener, options).await?;
                inner.state.lock().listeners.insert(channel.clone(), id);
                Ok::<_, Error>(id)
            }
        });

        let failure = join_all(registrations)
            .await
            .into_iter()
            .find_map(std::result::Result::err);

        if let Some(error) = failure {
            warn!(%error, "iterator registration failed, rolling back");
            let ids = self.terminate(None);
            self.unregister(ids).await;
            return Err(error);
        }

        let closed_meanwhile = {
            let mut state = self.state.lock();
            if state.phase == Phase::Terminated {
                Some(state.take_listeners())
            } else {
                state.phase = Phase::Listening;
                None
            }
        };

        match closed_meanwhile {
            Some(ids) => self.unregister(ids).await,
            None => debug!(channels = self.channels.len(), "iterator listening"),
        }

        Ok(())
    }

    /// Whether the owning pubsub has shut down (or is gone).
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Hands `payload` to the oldest live pull, or buffers it.
    fn push(&self, payload: Payload) {
        let mut state = self.state.lock();
        if state.phase == Phase::Terminated {
            return;
        }

        let mut value = Ok(Some(payload));
        while let Some(pull) = state.pending_pulls.pop_front() {
            // A pull whose future was dropped hands the value back.
            match pull.send(value) {
                Ok(()) => return,
                Err(unclaimed) => value = unclaimed,
            }
        }

        if let Ok(Some(payload)) = value {
            state.pending_values.push_back(payload);
        }
    }

    /// Moves to `Terminated`, settling every pending pull. The first live pull
    /// receives `error` if one is given. Returns the listeners still to
    /// unregister; settling only happens on the first call.
    fn terminate(&self, error: Option<Error>) -> Vec<ListenerId> {
        let mut state = self.state.lock();
        if state.phase != Phase::Terminated {
            state.phase = Phase::Terminated;
            state.pending_values.clear();

            let mut error = error;
            while let Some(pull) = state.pending_pulls.pop_front() {
                let outcome = error.take().map_or(Ok(None), Err);
                if let Err(Err(unclaimed)) = pull.send(outcome) {
                    error = Some(unclaimed);
                }
            }
        }

        state.take_listeners()
    }

    /// Best-effort removal of the given listeners.
    async fn unregister(&self, ids: Vec<ListenerId>) {
        let removals = ids.into_iter().map(|id| async move {
            if let Err(error) = self.registry.remove(id).await {
                warn!(%id, %error, "failed to unregister iterator listener");
            }
        });

        join_all(removals).await;
    }
}

impl<T> Drop for Inner<T>
where
    T: Transport,
{
    fn drop(&mut self) {
        let ids = self.state.get_mut().take_listeners();
        if ids.is_empty() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                listeners = ids.len(),
                "iterator dropped outside a runtime; listeners left registered"
            );
            return;
        };

        let registry = self.registry.clone();
        runtime.spawn(
            async move {
                for id in ids {
                    if let Err(error) = registry.remove(id).await {
                        warn!(%id, %error, "failed to unregister dropped iterator listener");
                    }
                }
            }
            .in_current_span(),
        );
    }
}

async fn shut_down(mut shutdown: watch::Receiver<bool>) {
    // A dropped sender means the pubsub itself is gone.
    let _ = shutdown.wait_for(|closed| *closed).await;
}

fn push_listener<T>(inner: Weak<Inner<T>>) -> Listener
where
    T: Transport,
{
    Arc::new(move |payload: Payload| {
        if let Some(inner) = inner.upgrade() {
            inner.push(payload);
        }
    })
}

/// Pull-based view over one or more channels.
///
/// Yields every value dispatched to any of its channels, in dispatch order,
/// until closed. Clones share the same queues, so several tasks can pull
/// concurrently; each value goes to exactly one pull.
pub struct SubscriptionIterator<T>
where
    T: Transport,
{
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SubscriptionIterator<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for SubscriptionIterator<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SubscriptionIterator")
            .field("channels", &self.inner.channels)
            .field("phase", &state.phase)
            .field("pending_values", &state.pending_values.len())
            .field("pending_pulls", &state.pending_pulls.len())
            .finish_non_exhaustive()
    }
}

impl<T> SubscriptionIterator<T>
where
    T: Transport,
{
    /// Creates an idle iterator. Nothing is registered until the first pull.
    ///
    /// Once `shutdown` turns `true` (or its sender is dropped) the iterator
    /// stops: pending pulls end and further pulls never register.
    pub fn new(
        registry: Arc<SubscriptionRegistry<T>>,
        triggers: &Triggers,
        trigger_transform: &TriggerTransform,
        subscribe_options: SubscribeOptionsResolver,
        context: Option<Value>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let channels = triggers.resolve(trigger_transform, context.as_ref());

        Self {
            inner: Arc::new(Inner {
                registry,
                channels,
                context,
                subscribe_options,
                registration: OnceCell::new(),
                shutdown,
                state: Mutex::new(BridgeState::default()),
            }),
        }
    }

    /// Channel names this iterator listens on.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.inner
            .channels
            .iter()
            .map(|(_, channel)| channel.as_str())
    }

    /// Returns whether the iterator has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().phase == Phase::Terminated
    }

    /// Waits for the next value. `Ok(None)` is the end marker.
    ///
    /// The first call registers the iterator's listeners and waits for every
    /// registration to complete. After the owning pubsub shuts down, pending
    /// and later pulls end.
    ///
    /// # Errors
    /// Returns the registration error to the pull(s) that triggered
    /// registration, [`Error::Closed`] if the pubsub shut down before the
    /// iterator was ever registered, or an error injected through
    /// [`throw`](Self::throw).
    pub async fn next(&self) -> Result<Option<Payload>> {
        let phase = self.inner.state.lock().phase;
        if phase == Phase::Terminated {
            return Ok(None);
        }

        if self.inner.is_shut_down() {
            let ids = self.inner.terminate(None);
            self.inner.unregister(ids).await;
            return if phase == Phase::Idle {
                Err(Error::Closed)
            } else {
                Ok(None)
            };
        }

        self.inner
            .registration
            .get_or_init(|| self.inner.clone().listen())
            .await
            .clone()?;

        let mut pull = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Terminated {
                return Ok(None);
            }

            if let Some(payload) = state.pending_values.pop_front() {
                return Ok(Some(payload));
            }

            let (pull, pending) = oneshot::channel();
            state.pending_pulls.push_back(pull);
            pending
        };

        tokio::select! {
            outcome = &mut pull => outcome.unwrap_or(Ok(None)),
            () = shut_down(self.inner.shutdown.clone()) => {
                debug!("pubsub shut down, ending iterator");
                let ids = self.inner.terminate(None);
                self.inner.unregister(ids).await;
                // Settled by `terminate`, unless a value got there first.
                pull.await.unwrap_or(Ok(None))
            }
        }
    }

    /// Closes the iterator: pending pulls resolve to the end marker, buffered
    /// values are discarded, and listeners are unregistered (failures are
    /// logged). Closing twice is a no-op.
    pub async fn close(&self) {
        let ids = self.inner.terminate(None);
        self.inner.unregister(ids).await;
    }

    /// Closes the iterator like [`close`](Self::close), but the oldest pending
    /// pull fails with `error` instead of ending.
    ///
    /// # Errors
    /// Always returns `error` back to the caller.
    pub async fn throw(&self, error: Error) -> Result<Option<Payload>> {
        let ids = self.inner.terminate(Some(error.clone()));
        self.inner.unregister(ids).await;

        Err(error)
    }

    /// Converts the iterator into a stream that ends at the end marker.
    pub fn into_stream(self) -> impl Stream<Item = Result<Payload>> + Send {
        futures::stream::unfold(self, |iterator| async move {
            match iterator.next().await {
                Ok(Some(payload)) => Some((Ok(payload), iterator)),
                Ok(None) => None,
                Err(error) => Some((Err(error), iterator)),
            }
        })
    }
}
