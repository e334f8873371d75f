//! Cluster-replicated observed-remove sets.
//!
//! One [`Replicator`] runs per (node, store key) and owns that node's
//! replica of the set. Writes mutate the local replica and gossip deltas to
//! peers; reads return the most recently merged local value. Convergence is
//! the CRDT merge's job, never a lock's.
//!
//! Store keys are fixed, one per subsystem:
//! - [`TOPICS_KEY`] — the topic-subscription registry
//! - [`ACK_LABELS_KEY`] — distributed acknowledgement-label declarations
//! - [`BLOCKED_NAMESPACES_KEY`] — the namespace blocklist (single shard)

pub mod orset;
pub mod replicator;

pub use orset::{MergeOutcome, OrSet, SetDelta, Tag};
pub use replicator::{Replicator, WriteConsistency};

/// Logical clock per replica.
pub type Clock = u64;

/// A replica (node) name.
pub type Replica = String;

/// Store key for the topic-subscription registry.
pub const TOPICS_KEY: &str = "topics";

/// Store key for distributed acknowledgement-label declarations.
pub const ACK_LABELS_KEY: &str = "ack-labels";

/// Store key for the namespace blocklist.
pub const BLOCKED_NAMESPACES_KEY: &str = "blocked-namespaces";
