//! In-process cluster fabric and node wiring.
//!
//! The replicators gossip over whatever membership/transport layer the
//! deployment already has; this module provides the in-process realization
//! of that layer: per-key peer tables routing gossip envelopes between
//! replicator actors, and the cluster-wide subscriber table that resolves
//! replicated ids back to live handles. Joining spawns a node's replicators
//! and coordinators and returns the [`Node`] facade over them.

use crate::acks::{spawn_ack_coordinator, AckLabelArbiter, AckSettings, NoopAckArbiter};
use crate::blocklist::BlockedNamespaces;
use crate::config::{AckRole, NodeConfig};
use crate::ddata::replicator::{Envelope, GossipLinks, PeerTable, ReplicatorSettings};
use crate::ddata::{Replicator, ACK_LABELS_KEY, BLOCKED_NAMESPACES_KEY, TOPICS_KEY};
use crate::error::Error;
use crate::pubsub::{
    spawn_publisher, spawn_registry, FilterTable, Publisher, RegistrySettings,
    SubscriptionRegistry,
};
use crate::subscriber::{Delivery, Resolver, SubscriberId, SubscriberRef};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct ClusterInner {
    resolver: Resolver,
    topics: PeerTable,
    acks: PeerTable,
    namespaces: PeerTable,
}

/// A handle to the shared cluster fabric. Clones refer to the same cluster.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                resolver: Arc::new(DashMap::new()),
                topics: Arc::new(RwLock::new(HashMap::new())),
                acks: Arc::new(RwLock::new(HashMap::new())),
                namespaces: Arc::new(RwLock::new(HashMap::new())),
            }),
        }
    }

    /// Join the cluster as a new node, spawning its replicators and
    /// coordinators.
    pub async fn join(&self, config: NodeConfig) -> Result<Node, Error> {
        let replica = config.replica.clone();
        tracing::debug!(replica = %replica, ack_role = ?config.ack_role, "node joining cluster");

        let topic_store = self.spawn_replicator(&config, TOPICS_KEY, &self.inner.topics);
        let namespace_store =
            self.spawn_replicator(&config, BLOCKED_NAMESPACES_KEY, &self.inner.namespaces);

        let filters: FilterTable = Arc::new(DashMap::new());
        let subscriptions = spawn_registry(
            RegistrySettings {
                write: config.subscription_write,
                propagation_delay: config.propagation_delay,
                ask_timeout: config.ask_timeout,
                mailbox_capacity: config.mailbox_capacity,
            },
            topic_store.clone(),
            Arc::clone(&filters),
            Arc::clone(&self.inner.resolver),
        );
        let publisher = spawn_publisher(
            &config,
            &topic_store,
            filters,
            Arc::clone(&self.inner.resolver),
        )
        .await?;

        let acks: Arc<dyn AckLabelArbiter> = match config.ack_role {
            AckRole::Arbiter => {
                let ack_store = self.spawn_replicator(&config, ACK_LABELS_KEY, &self.inner.acks);
                Arc::new(
                    spawn_ack_coordinator(
                        AckSettings {
                            replica: replica.clone(),
                            write: config.declaration_write,
                            ask_timeout: config.ask_timeout,
                            mailbox_capacity: config.mailbox_capacity,
                        },
                        ack_store,
                    )
                    .await?,
                )
            }
            AckRole::None => Arc::new(NoopAckArbiter),
        };

        let blocked = BlockedNamespaces::new(namespace_store);

        Ok(Node {
            replica,
            subscriber_seq: Arc::new(AtomicU64::new(0)),
            subscriptions,
            publisher,
            acks,
            blocked,
            cluster: self.clone(),
        })
    }

    fn spawn_replicator<T>(
        &self,
        config: &NodeConfig,
        key: &'static str,
        table: &PeerTable,
    ) -> Replicator<T>
    where
        T: Clone + Eq + Hash + Debug + Send + Serialize + DeserializeOwned + 'static,
    {
        let (tx, rx) = mpsc::channel::<Envelope>(config.mailbox_capacity);
        table.write().insert(config.replica.clone(), tx);
        Replicator::spawn(
            ReplicatorSettings {
                key,
                replica: config.replica.clone(),
                gossip_interval: config.gossip_interval,
                read_timeout: config.read_timeout,
                write_timeout: config.write_timeout,
                mailbox_capacity: config.mailbox_capacity,
            },
            GossipLinks::new(key, config.replica.clone(), Arc::clone(table)),
            rx,
        )
    }

    fn remove_peer(&self, replica: &str) {
        self.inner.topics.write().remove(replica);
        self.inner.acks.write().remove(replica);
        self.inner.namespaces.write().remove(replica);
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

/// One cluster member: the coordinators running on this node.
#[derive(Clone)]
pub struct Node {
    replica: String,
    subscriber_seq: Arc<AtomicU64>,
    subscriptions: SubscriptionRegistry,
    publisher: Publisher,
    acks: Arc<dyn AckLabelArbiter>,
    blocked: BlockedNamespaces,
    cluster: Cluster,
}

impl Node {
    /// This node's replica name.
    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// The subscriber-registry coordinator.
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// The publisher coordinator.
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// The acknowledgement-label arbiter (a null object on nodes with
    /// [`AckRole::None`]).
    pub fn acks(&self) -> &dyn AckLabelArbiter {
        self.acks.as_ref()
    }

    /// The namespace blocklist.
    pub fn blocked_namespaces(&self) -> &BlockedNamespaces {
        &self.blocked
    }

    /// Mint a subscriber handle homed on this node.
    pub fn subscriber(&self, capacity: usize) -> (SubscriberRef, mpsc::Receiver<Delivery>) {
        let seq = self.subscriber_seq.fetch_add(1, Ordering::Relaxed);
        SubscriberRef::channel(SubscriberId::new(self.replica.clone(), seq), capacity)
    }

    /// Disconnect this node from the fabric. Its coordinators stop receiving
    /// gossip and other nodes stop counting it for write-all.
    pub fn leave(&self) {
        tracing::debug!(replica = %self.replica, "node leaving cluster");
        self.cluster.remove_peer(&self.replica);
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("replica", &self.replica).finish()
    }
}
