//! Error types for coordinator and store operations.

use crate::signal::Headers;
use crate::subscriber::SubscriberId;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the pub/sub and coordination layer.
///
/// Locally recoverable conditions (undecodable gossip, degraded reads) are
/// absorbed and logged inside the coordinators; everything that affects a
/// caller's correctness guarantee arrives here as a typed variant.
#[derive(Debug, Error)]
pub enum Error {
    /// An ask to a coordinator did not complete within its configured bound.
    /// Callers decide whether to retry; coordinators never retry themselves.
    #[error("ask timed out after {0:?}")]
    Timeout(Duration),

    /// The coordinator's mailbox is gone (its node shut down).
    #[error("coordinator unavailable")]
    CoordinatorClosed,

    /// An acknowledgement label is already owned by another subscriber,
    /// either at declaration time or discovered later when the distributed
    /// view converged.
    #[error("acknowledgement label {label:?} is not unique, owned by {owner}")]
    AckLabelNotUnique {
        /// The conflicted label.
        label: String,
        /// The surviving owner.
        owner: SubscriberId,
    },

    /// This node does not participate in acknowledgement-label bookkeeping.
    #[error("acknowledgement label declarations are not supported on this node")]
    AckDeclarationUnsupported,

    /// The signal addresses an entity in a blocked namespace.
    #[error("namespace {namespace:?} is blocked")]
    NamespaceBlocked {
        /// The blocked namespace.
        namespace: String,
        /// The original headers of the rejected signal.
        headers: Headers,
    },
}
