//! Node configuration.
//!
//! Loading these values from files or the environment is the embedding
//! application's concern; this module only defines the tunables the
//! coordinators consume.

use crate::ddata::WriteConsistency;
use crate::signal::{ExtractAcks, ExtractTopics, HeaderAckExtractor, HeaderTopicExtractor};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Whether a node takes part in acknowledgement-label bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckRole {
    /// Runs the acknowledgement-label coordinator.
    #[default]
    Arbiter,
    /// Does not participate; all declare operations fail immediately.
    None,
}

/// Configuration for one cluster node.
#[derive(Clone)]
pub struct NodeConfig {
    /// The node's replica name; must be unique within the cluster.
    pub replica: String,
    /// Mailbox capacity for coordinator and replicator actors.
    pub mailbox_capacity: usize,
    /// How often pending deltas are flushed and anti-entropy runs.
    pub gossip_interval: Duration,
    /// Bound on ask-style operations against local coordinators.
    pub ask_timeout: Duration,
    /// Bound on read-local snapshots.
    pub read_timeout: Duration,
    /// Bound on write-all replication.
    pub write_timeout: Duration,
    /// Extra delay before a subscription ack resolves, bounding the window
    /// in which remote publishers have not yet seen the new entry.
    /// Zero disables the compensation.
    pub propagation_delay: Duration,
    /// Consistency for subscription writes.
    pub subscription_write: WriteConsistency,
    /// Consistency for acknowledgement-label declaration writes.
    pub declaration_write: WriteConsistency,
    /// Acknowledgement-label participation.
    pub ack_role: AckRole,
    /// Computes the topics a signal is published under.
    pub topic_extractor: Arc<dyn ExtractTopics>,
    /// Extracts acknowledgement requests from signals.
    pub ack_extractor: Arc<dyn ExtractAcks>,
}

impl NodeConfig {
    /// Configuration with defaults for the given replica name.
    pub fn new(replica: impl Into<String>) -> Self {
        Self {
            replica: replica.into(),
            mailbox_capacity: 256,
            gossip_interval: Duration::from_millis(100),
            ask_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            propagation_delay: Duration::ZERO,
            subscription_write: WriteConsistency::Local,
            declaration_write: WriteConsistency::Local,
            ack_role: AckRole::Arbiter,
            topic_extractor: Arc::new(HeaderTopicExtractor),
            ack_extractor: Arc::new(HeaderAckExtractor),
        }
    }

    /// Set the gossip interval.
    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Set the ask timeout.
    pub fn ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }

    /// Set the write timeout.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the subscription propagation delay.
    pub fn propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    /// Set the consistency for subscription writes.
    pub fn subscription_write(mut self, write: WriteConsistency) -> Self {
        self.subscription_write = write;
        self
    }

    /// Set the acknowledgement-label participation.
    pub fn ack_role(mut self, role: AckRole) -> Self {
        self.ack_role = role;
        self
    }

    /// Set the topic extractor.
    pub fn topic_extractor(mut self, extractor: impl ExtractTopics) -> Self {
        self.topic_extractor = Arc::new(extractor);
        self
    }

    /// Set the acknowledgement extractor.
    pub fn ack_extractor(mut self, extractor: impl ExtractAcks) -> Self {
        self.ack_extractor = Arc::new(extractor);
        self
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("replica", &self.replica)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("gossip_interval", &self.gossip_interval)
            .field("ask_timeout", &self.ask_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("propagation_delay", &self.propagation_delay)
            .field("subscription_write", &self.subscription_write)
            .field("declaration_write", &self.declaration_write)
            .field("ack_role", &self.ack_role)
            .finish_non_exhaustive()
    }
}
