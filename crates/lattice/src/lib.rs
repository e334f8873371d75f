//! # Lattice - Brokerless Cluster Pub/Sub and Coordination
//!
//! Lattice is the publish/subscribe and distributed-coordination layer of a
//! multi-node service mesh: any node can publish a typed signal and have it
//! delivered to exactly the interested subscribers anywhere in the cluster,
//! with no central broker and no consensus protocol. Membership state lives
//! in replicated observed-remove sets that converge by merge, not by lock.
//!
//! # Overview
//!
//! - **Replicated set store** ([`ddata`]): generic ORSWOT replicas, one
//!   per node and store key, kept in sync by delta gossip and anti-entropy.
//! - **Subscriber registry** ([`pubsub::SubscriptionRegistry`]): mutates
//!   the topic registry on subscribe/unsubscribe and watches subscriber
//!   handles for termination.
//! - **Publisher** ([`pubsub::Publisher`]): matches a signal's topics
//!   against the most recently merged registry view and elects exactly one
//!   subscriber per topic group by deterministic hashing, preserving
//!   per-entity ordering without a sequencer.
//! - **Acknowledgement labels** ([`acks`]): cluster-unique label ownership
//!   with leaderless conflict detection; losers of a concurrent declaration
//!   race are notified, never silently dropped.
//! - **Namespace blocklist** ([`blocklist`]): a single-shard replicated set
//!   gating entity-addressed signals during maintenance; reads fail open.
//! - **Streaming classifier** ([`streaming`]): a pure pre-filter mapping
//!   signals onto named delivery channels.
//!
//! # Quick Start
//!
//! ```ignore
//! use lattice::{Cluster, NodeConfig, SubscribeOptions};
//!
//! let cluster = Cluster::new();
//! let node = cluster.join(NodeConfig::new("node-a")).await?;
//!
//! let (subscriber, mut inbox) = node.subscriber(64);
//! node.subscriptions()
//!     .subscribe(vec!["room.events".into()], &subscriber, SubscribeOptions::new().group("g1"))
//!     .await?;
//!
//! node.publisher().publish(signal, "room-42").await?;
//! while let Some(delivery) = inbox.recv().await {
//!     // ...
//! }
//! ```
//!
//! # Consistency
//!
//! Every coordinator is a single sequential message processor owning its
//! state exclusively; cross-node concurrency exists only in the gossip
//! layer and is resolved by CRDT merge rules. Reads for publishing use the
//! last merged local value — availability over freshness. Ask-style calls
//! are bounded by timeouts and never retried by the coordinators.

#![warn(missing_docs)]

pub mod acks;
pub mod blocklist;
pub mod cluster;
pub mod config;
pub mod ddata;
pub mod error;
pub mod pubsub;
pub mod signal;
pub mod streaming;
pub mod subscriber;

pub use cluster::{Cluster, Node};
pub use config::{AckRole, NodeConfig};
pub use ddata::WriteConsistency;
pub use error::Error;
pub use pubsub::{Publisher, SubscribeOptions, SubscriptionRegistry};
pub use signal::{AckRequest, EntityId, Headers, Signal};
pub use streaming::{classify, StreamingType};
pub use subscriber::{Delivery, PublishedSignal, SubscriberId, SubscriberRef};
