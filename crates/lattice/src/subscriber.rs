//! Subscriber handles and the messages delivered to them.
//!
//! A [`SubscriberRef`] pairs a stable, replicable [`SubscriberId`] with the
//! local delivery channel. Replicated entries only ever carry the id; live
//! handles are resolved through the cluster's subscriber table at delivery
//! time. The handle also provides the termination watch: when the receiving
//! end is dropped, every coordinator tracking the subscriber runs the same
//! cleanup path as an explicit removal.

use crate::signal::{AckRequest, Signal};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stable identity of a subscriber: the replica it was created on plus a
/// per-replica sequence number. This is what replicated entries store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId {
    replica: String,
    seq: u64,
}

impl SubscriberId {
    /// Create a subscriber id.
    pub fn new(replica: impl Into<String>, seq: u64) -> Self {
        Self {
            replica: replica.into(),
            seq,
        }
    }

    /// The replica the subscriber was created on.
    pub fn replica(&self) -> &str {
        &self.replica
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.replica, self.seq)
    }
}

/// A signal delivered to one selected subscriber.
#[derive(Debug, Clone)]
pub struct PublishedSignal {
    /// The published signal.
    pub signal: Signal,
    /// The matched topics this subscriber was selected for.
    pub topics: BTreeSet<String>,
    /// Acknowledgement metadata, present for `publish_with_acks` deliveries.
    pub acks: Option<AckRequest>,
    /// The publisher-supplied reply handle, if any.
    pub reply_to: Option<SubscriberRef>,
}

/// What flows into a subscriber's mailbox.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A published signal routed to this subscriber.
    Signal(PublishedSignal),
    /// An acknowledgement label this subscriber declared turned out to be
    /// claimed by another subscriber; the declaration has been withdrawn.
    AckLabelNotUnique {
        /// The conflicted label.
        label: String,
        /// The surviving owner.
        owner: SubscriberId,
    },
}

/// A live handle to a subscriber's mailbox.
///
/// Equality and hashing follow the [`SubscriberId`] only, so clones of the
/// same handle compare equal.
#[derive(Clone)]
pub struct SubscriberRef {
    id: SubscriberId,
    tx: mpsc::Sender<Delivery>,
}

impl SubscriberRef {
    /// Create a subscriber handle and its receiving side.
    pub fn channel(id: SubscriberId, capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { id, tx }, rx)
    }

    /// The subscriber's stable identity.
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Best-effort delivery into the subscriber's mailbox.
    ///
    /// A full mailbox drops the message (delivery is at-most-available, not
    /// guaranteed); a closed mailbox is ignored, the termination watch will
    /// clean the subscriber up shortly.
    pub(crate) fn deliver(&self, delivery: Delivery) {
        match self.tx.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = %self.id, "subscriber mailbox full, dropping delivery");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(subscriber = %self.id, "subscriber mailbox closed, dropping delivery");
            }
        }
    }

    /// Resolves when the subscriber's receiving side has been dropped.
    ///
    /// This is the termination watch: coordinators await it and treat
    /// completion as an implicit "remove everything owned by this handle".
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    /// Whether the receiving side is already gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for SubscriberRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubscriberRef {}

impl Hash for SubscriberRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for SubscriberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SubscriberRef").field(&self.id).finish()
    }
}

/// Cluster-wide table resolving subscriber ids back to live handles.
pub(crate) type Resolver = Arc<DashMap<SubscriberId, SubscriberRef>>;
