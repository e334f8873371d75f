//! Topic-registry entries and subscription options.

use crate::subscriber::SubscriberId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One replicated topic-registry entry.
///
/// The generation makes entries unique per subscriber incarnation: removal
/// under add-wins merge is only well-defined for an entry the remover has
/// observed, and a resubscribing process must replace its old entries
/// instead of colliding with them. At most one entry exists per
/// `(topic, subscriber, generation)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    /// The topic string. Opaque; equality is the only structure.
    pub topic: String,
    /// The subscribing endpoint.
    pub subscriber: SubscriberId,
    /// Optional group label partitioning subscribers into alternatives.
    pub group: Option<String>,
    /// The subscriber's generation at subscribe time.
    pub generation: u64,
}

/// A node-local delivery filter.
///
/// Receives the full matched-topic set of a publish; returning `false`
/// suppresses the delivery. Predicates are code, not data — they never
/// travel through the replicated registry and only apply on the node the
/// subscriber registered on.
pub type TopicFilter = Arc<dyn Fn(&BTreeSet<String>) -> bool + Send + Sync>;

/// Per-node table of registered filters, shared between the subscription
/// registry (writes) and the publisher (reads).
pub(crate) type FilterTable = Arc<DashMap<SubscriberId, TopicFilter>>;

/// Options for a subscribe call.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Optional delivery filter over the matched-topic set.
    pub filter: Option<TopicFilter>,
    /// Optional group label.
    pub group: Option<String>,
    /// Replace entries from this subscriber's previous generation. Set when
    /// a restarted subscriber re-establishes its state; without it a
    /// repeated subscribe is a no-op duplicate.
    pub resubscribe: bool,
}

impl SubscribeOptions {
    /// Options with no filter, no group, no generation replacement.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the group label.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the delivery filter.
    pub fn filter(
        mut self,
        filter: impl Fn(&BTreeSet<String>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Mark this subscribe as a generation replacement.
    pub fn resubscribe(mut self) -> Self {
        self.resubscribe = true;
        self
    }
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("filter", &self.filter.as_ref().map(|_| "<predicate>"))
            .field("group", &self.group)
            .field("resubscribe", &self.resubscribe)
            .finish()
    }
}
