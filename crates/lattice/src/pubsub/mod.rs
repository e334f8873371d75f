//! Distributed publish/subscribe.
//!
//! Subscriptions live in a cluster-replicated observed-remove set; each node
//! runs two coordinators over it. The [`SubscriptionRegistry`] mutates the
//! local replica on subscribe/unsubscribe and watches subscriber handles for
//! termination. The [`Publisher`] reads the most recently merged view,
//! matches a signal's topics against it, and selects exactly one subscriber
//! per topic group by deterministic hashing, so that everything published
//! under one group-index key lands on the same subscriber.

mod publisher;
mod registry;
mod types;

pub use publisher::Publisher;
pub use registry::SubscriptionRegistry;
pub use types::{SubscribeOptions, Subscription, TopicFilter};

pub(crate) use publisher::spawn_publisher;
pub(crate) use registry::{spawn_registry, RegistrySettings};
pub(crate) use types::FilterTable;
