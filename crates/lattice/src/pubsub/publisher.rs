//! The publisher coordinator.
//!
//! Keeps the most recently merged topic-registry view cached (fed by the
//! replicator's change stream — never a synchronous cluster-wide read) and
//! routes each published signal: match topics, partition candidates by
//! group, elect one subscriber per partition by deterministic hash, apply
//! the node-local filter, deliver.

use super::types::{FilterTable, Subscription};
use crate::config::NodeConfig;
use crate::ddata::Replicator;
use crate::error::Error;
use crate::signal::{ExtractAcks, ExtractTopics, Signal};
use crate::subscriber::{Delivery, PublishedSignal, Resolver, SubscriberId, SubscriberRef};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Pinned FNV-1a 64 over the group-index key.
///
/// Every node must compute the same hash for the same key or the "same key,
/// same subscriber" guarantee breaks; std hashers are randomized per process
/// and are therefore unusable here.
fn fnv1a_64(key: &str) -> i64 {
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i64
}

/// Slot for a group-index key among `len` sorted candidates.
///
/// `i64::MIN` has no absolute value; it is pinned to slot 0 so every node
/// agrees instead of overflowing.
fn group_slot(key: &str, len: usize) -> usize {
    debug_assert!(len > 0);
    match fnv1a_64(key).checked_abs() {
        Some(abs) => (abs as u64 % len as u64) as usize,
        None => 0,
    }
}

enum PublishRequest {
    Publish {
        signal: Signal,
        group_key: String,
        reply_to: Option<SubscriberRef>,
        with_acks: bool,
    },
}

/// Handle to the node's publisher coordinator.
///
/// Publishing is fire-and-forget: the call resolves once the request is in
/// the coordinator's mailbox, not when subscribers have seen it.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<PublishRequest>,
}

pub(crate) async fn spawn_publisher(
    config: &NodeConfig,
    store: &Replicator<Subscription>,
    filters: FilterTable,
    resolver: Resolver,
) -> Result<Publisher, Error> {
    let changes = store.subscribe_to_changes().await?;
    let (tx, rx) = mpsc::channel(config.mailbox_capacity);
    let worker = Worker {
        index: HashMap::new(),
        filters,
        resolver,
        topic_extractor: Arc::clone(&config.topic_extractor),
        ack_extractor: Arc::clone(&config.ack_extractor),
    };
    tokio::spawn(worker.run(rx, changes));
    Ok(Publisher { tx })
}

impl Publisher {
    /// Publish a signal, routing every matching topic group by `group_key`.
    ///
    /// All signals published under the same group-index key (typically an
    /// entity id) reach the same subscriber within a group, which is what
    /// preserves per-entity ordering without a central sequencer.
    pub async fn publish(&self, signal: Signal, group_key: &str) -> Result<(), Error> {
        self.send(signal, group_key, None, false).await
    }

    /// Publish with a reply handle attached to each delivery.
    pub async fn publish_from(
        &self,
        signal: Signal,
        group_key: &str,
        reply_to: SubscriberRef,
    ) -> Result<(), Error> {
        self.send(signal, group_key, Some(reply_to), false).await
    }

    /// Publish and attach extracted acknowledgement requests to deliveries.
    /// Degrades to a plain publish when the signal requests no acks.
    pub async fn publish_with_acks(&self, signal: Signal, group_key: &str) -> Result<(), Error> {
        self.send(signal, group_key, None, true).await
    }

    /// [`Publisher::publish_with_acks`] with a reply handle.
    pub async fn publish_with_acks_from(
        &self,
        signal: Signal,
        group_key: &str,
        reply_to: SubscriberRef,
    ) -> Result<(), Error> {
        self.send(signal, group_key, Some(reply_to), true).await
    }

    async fn send(
        &self,
        signal: Signal,
        group_key: &str,
        reply_to: Option<SubscriberRef>,
        with_acks: bool,
    ) -> Result<(), Error> {
        self.tx
            .send(PublishRequest::Publish {
                signal,
                group_key: group_key.to_string(),
                reply_to,
                with_acks,
            })
            .await
            .map_err(|_| Error::CoordinatorClosed)
    }
}

struct Worker {
    /// topic -> entries, rebuilt from each merged registry snapshot.
    index: HashMap<String, Vec<Subscription>>,
    filters: FilterTable,
    resolver: Resolver,
    topic_extractor: Arc<dyn ExtractTopics>,
    ack_extractor: Arc<dyn ExtractAcks>,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<PublishRequest>,
        mut changes: mpsc::Receiver<Vec<Subscription>>,
    ) {
        loop {
            tokio::select! {
                // Drain registry updates first so a publish issued right
                // after a local subscribe ack sees the new entry.
                biased;
                snapshot = changes.recv() => match snapshot {
                    Some(snapshot) => self.rebuild_index(snapshot),
                    None => break,
                },
                request = rx.recv() => match request {
                    Some(PublishRequest::Publish { signal, group_key, reply_to, with_acks }) => {
                        self.publish(signal, &group_key, reply_to, with_acks);
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("publisher stopped");
    }

    fn rebuild_index(&mut self, snapshot: Vec<Subscription>) {
        let mut index: HashMap<String, Vec<Subscription>> = HashMap::new();
        for entry in snapshot {
            index.entry(entry.topic.clone()).or_default().push(entry);
        }
        self.index = index;
    }

    fn publish(
        &self,
        signal: Signal,
        group_key: &str,
        reply_to: Option<SubscriberRef>,
        with_acks: bool,
    ) {
        let topics = self.topic_extractor.topics(&signal);
        let matched: BTreeSet<String> = topics
            .iter()
            .filter(|t| self.index.contains_key(*t))
            .cloned()
            .collect();
        if matched.is_empty() {
            tracing::trace!(signal_type = signal.signal_type(), "no matching topics");
            return;
        }

        // For every matched topic, elect one subscriber per group partition
        // (the no-group partition included), then dedupe across topics so a
        // subscriber chosen for several topics sees the signal once.
        let mut chosen: BTreeMap<SubscriberId, BTreeSet<String>> = BTreeMap::new();
        for topic in &matched {
            let entries = &self.index[topic];
            let mut groups: BTreeMap<Option<&str>, BTreeSet<&SubscriberId>> = BTreeMap::new();
            for entry in entries {
                groups
                    .entry(entry.group.as_deref())
                    .or_default()
                    .insert(&entry.subscriber);
            }
            for members in groups.values() {
                let ordered: Vec<&SubscriberId> = members.iter().copied().collect();
                let winner = ordered[group_slot(group_key, ordered.len())];
                chosen
                    .entry(winner.clone())
                    .or_default()
                    .insert(topic.clone());
            }
        }

        let acks = if with_acks {
            self.ack_extractor.acks(&signal)
        } else {
            None
        };

        for (subscriber, topics_for) in chosen {
            let filter = self
                .filters
                .get(&subscriber)
                .map(|entry| Arc::clone(entry.value()));
            if let Some(filter) = filter {
                // The filter judges the full matched set, not just the
                // topics this subscriber was elected for.
                if !(*filter)(&matched) {
                    tracing::trace!(subscriber = %subscriber, "delivery suppressed by filter");
                    continue;
                }
            }
            match self.resolver.get(&subscriber) {
                Some(handle) => {
                    handle.value().deliver(Delivery::Signal(PublishedSignal {
                        signal: signal.clone(),
                        topics: topics_for,
                        acks: acks.clone(),
                        reply_to: reply_to.clone(),
                    }));
                }
                None => {
                    tracing::trace!(
                        subscriber = %subscriber,
                        "no live handle for selected subscriber"
                    );
                }
            }
        }
    }
}
