use crate::codec::{PayloadCodec, PayloadEncoding};
use crate::error::BoxError;
use crate::registry::ListenerId;
use crate::transport::ConnectionEvent;
use crate::trigger::{self, TriggerTransform};

use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

/// Delivery quality level requested from (or granted by) the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    /// Fire and forget (level 0).
    #[default]
    AtMostOnce = 0,

    /// Acknowledged delivery, duplicates possible (level 1).
    AtLeastOnce = 1,

    /// Assured single delivery (level 2).
    ExactlyOnce = 2,
}

/// Options for a transport-level subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Requested delivery quality.
    pub qos: QoS,
}

/// Options for a single publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Requested delivery quality.
    pub qos: QoS,

    /// Ask the broker to keep this as the last known value of the channel.
    pub retain: bool,
}

/// Parameters granted by the transport for one subscribed channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    /// Channel the grant applies to.
    pub channel: String,

    /// Delivery quality actually granted.
    pub qos: QoS,
}

/// Resolves transport options for a publish from the trigger and payload.
pub type PublishOptionsResolver =
    Arc<dyn Fn(&str, &Value) -> BoxFuture<'static, Result<PublishOptions, BoxError>> + Send + Sync>;

/// Resolves transport options for a subscription from the trigger and context.
pub type SubscribeOptionsResolver = Arc<
    dyn Fn(&str, Option<&Value>) -> BoxFuture<'static, Result<SubscribeOptions, BoxError>>
        + Send
        + Sync,
>;

/// Called once a transport subscription has been granted.
pub type SubscribeHook = Arc<dyn Fn(ListenerId, &[Grant]) + Send + Sync>;

/// Receives connection lifecycle notifications from the transport.
pub type ConnectionListener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Configuration for [`PubSub`](crate::PubSub).
#[derive(Clone)]
pub struct PubSubOptions {
    /// Maps logical event names to channel names. Defaults to identity.
    pub trigger_transform: TriggerTransform,

    /// Per-publish option resolver. Defaults to `PublishOptions::default()`.
    pub publish_options: PublishOptionsResolver,

    /// Per-subscription option resolver. Defaults to `SubscribeOptions::default()`.
    pub subscribe_options: SubscribeOptionsResolver,

    /// Subscription-accepted hook. Defaults to a no-op.
    pub on_subscribe: SubscribeHook,

    /// Connection event listener. When absent, events are only logged.
    pub connection_listener: Option<ConnectionListener>,

    /// Wire encoding of payload text.
    pub encoding: PayloadEncoding,

    /// Hand raw bytes to listeners instead of parsing payloads.
    pub disable_message_parse: bool,
}

impl Default for PubSubOptions {
    fn default() -> Self {
        Self {
            trigger_transform: trigger::identity(),
            publish_options: Arc::new(|_: &str, _: &Value| {
                futures::future::ready(Ok::<_, BoxError>(PublishOptions::default())).boxed()
            }),
            subscribe_options: Arc::new(|_: &str, _: Option<&Value>| {
                futures::future::ready(Ok::<_, BoxError>(SubscribeOptions::default())).boxed()
            }),
            on_subscribe: Arc::new(|_: ListenerId, _: &[Grant]| {}),
            connection_listener: None,
            encoding: PayloadEncoding::default(),
            disable_message_parse: false,
        }
    }
}

impl Debug for PubSubOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubOptions")
            .field("connection_listener", &self.connection_listener.is_some())
            .field("encoding", &self.encoding)
            .field("disable_message_parse", &self.disable_message_parse)
            .finish_non_exhaustive()
    }
}

impl PubSubOptions {
    /// Sets the trigger transform.
    #[must_use]
    pub fn with_trigger_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&str, Option<&Value>) -> String + Send + Sync + 'static,
    {
        self.trigger_transform = Arc::new(transform);
        self
    }

    /// Sets the publish options resolver.
    #[must_use]
    pub fn with_publish_options<F, Fut>(mut self, resolver: F) -> Self
    where
        F: Fn(&str, &Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PublishOptions, BoxError>> + Send + 'static,
    {
        self.publish_options = Arc::new(move |trigger: &str, payload: &Value| {
            resolver(trigger, payload).boxed()
        });
        self
    }

    /// Sets the subscribe options resolver.
    #[must_use]
    pub fn with_subscribe_options<F, Fut>(mut self, resolver: F) -> Self
    where
        F: Fn(&str, Option<&Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SubscribeOptions, BoxError>> + Send + 'static,
    {
        self.subscribe_options = Arc::new(move |trigger: &str, context: Option<&Value>| {
            resolver(trigger, context).boxed()
        });
        self
    }

    /// Sets the subscription-accepted hook.
    #[must_use]
    pub fn with_on_subscribe<F>(mut self, hook: F) -> Self
    where
        F: Fn(ListenerId, &[Grant]) + Send + Sync + 'static,
    {
        self.on_subscribe = Arc::new(hook);
        self
    }

    /// Sets the connection event listener.
    #[must_use]
    pub fn with_connection_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.connection_listener = Some(Arc::new(listener));
        self
    }

    /// Sets the payload wire encoding.
    #[must_use]
    pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Disables payload parsing; listeners receive raw bytes.
    #[must_use]
    pub fn with_message_parse_disabled(mut self) -> Self {
        self.disable_message_parse = true;
        self
    }

    pub(crate) const fn codec(&self) -> PayloadCodec {
        PayloadCodec::new(self.encoding, !self.disable_message_parse)
    }
}
