//! Cluster-unique acknowledgement-label ownership.
//!
//! An acknowledgement label names a channel that at most one subscriber may
//! own cluster-wide. There is no leader to serialize claims: each node's
//! coordinator commits declarations locally and the replicated view
//! converges afterwards. Two nodes can therefore both briefly believe they
//! own a label; the coordinator detects the collision when the merged view
//! reveals it, deterministically elects one survivor, withdraws the losing
//! declaration and tells the losing subscriber — a lost race is reported,
//! never silent.

mod server;

use crate::error::Error;
use crate::subscriber::{SubscriberId, SubscriberRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use server::AckCoordinator;

pub(crate) use server::{spawn_ack_coordinator, AckSettings};

/// One replicated acknowledgement-label declaration.
///
/// `origin` and `seq` order concurrent declarations: every replica elects
/// the same winner by the lowest `(seq, origin, subscriber)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckDeclaration {
    /// The declared label.
    pub label: String,
    /// The declaring subscriber.
    pub subscriber: SubscriberId,
    /// Optional group the subscriber belongs to.
    pub group: Option<String>,
    /// The replica the declaration was made on.
    pub origin: String,
    /// Declaration order on the originating coordinator.
    pub seq: u64,
}

/// Capability seam for acknowledgement-label arbitration.
///
/// Nodes that participate run an [`AckCoordinator`]; nodes that do not get
/// the [`NoopAckArbiter`] — same surface, fixed answers, not an error
/// condition.
#[async_trait]
pub trait AckLabelArbiter: Send + Sync {
    /// Claim every label in the batch for `subscriber`, atomically from this
    /// coordinator's perspective: if any label is already owned by another
    /// subscriber in the currently-known view, nothing commits and the call
    /// fails with [`Error::AckLabelNotUnique`].
    ///
    /// A successful declaration can still lose a concurrent cross-node race
    /// later; the subscriber then receives
    /// [`crate::subscriber::Delivery::AckLabelNotUnique`].
    async fn declare(
        &self,
        labels: Vec<String>,
        subscriber: &SubscriberRef,
        group: Option<String>,
    ) -> Result<(), Error>;

    /// Relinquish every label owned by the subscriber. Fire-and-forget and
    /// idempotent; also triggered by the subscriber's termination watch.
    fn relinquish(&self, subscriber: &SubscriberId);

    /// Stream of merged distributed-view snapshots, so interested local
    /// parties can observe remote declaration changes.
    async fn watch_declarations(&self) -> Result<mpsc::Receiver<Vec<AckDeclaration>>, Error>;
}

/// Null object for nodes outside the acknowledgement bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAckArbiter;

#[async_trait]
impl AckLabelArbiter for NoopAckArbiter {
    async fn declare(
        &self,
        _labels: Vec<String>,
        _subscriber: &SubscriberRef,
        _group: Option<String>,
    ) -> Result<(), Error> {
        Err(Error::AckDeclarationUnsupported)
    }

    fn relinquish(&self, _subscriber: &SubscriberId) {}

    async fn watch_declarations(&self) -> Result<mpsc::Receiver<Vec<AckDeclaration>>, Error> {
        // A closed, empty stream: recv() yields None immediately.
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}
