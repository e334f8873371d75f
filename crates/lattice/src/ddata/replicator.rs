//! The per-key replicator actor.
//!
//! One replicator task owns a node's [`OrSet`] replica for one store key.
//! All mutations arrive through its mailbox and are applied one at a time;
//! peers only ever interact with it through gossip envelopes. Deltas travel
//! as postcard bytes so a corrupt or unknown payload can be dropped without
//! touching the replica.

use super::orset::{OrSet, SetDelta};
use super::{Clock, Replica};
use crate::error::Error;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How far a write must propagate before its ack resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConsistency {
    /// Commit locally and gossip asynchronously; do not wait.
    Local,
    /// Wait until every currently-known peer has acknowledged the delta,
    /// bounded by the configured write timeout.
    All,
}

/// A gossip envelope as it travels between replicator actors.
pub(crate) struct Envelope {
    /// The sending replica.
    pub from: Replica,
    /// Postcard-encoded [`GossipPayload`].
    pub bytes: Vec<u8>,
}

/// Peer table for one store key: replica name to gossip inbox.
pub(crate) type PeerTable = Arc<RwLock<HashMap<Replica, mpsc::Sender<Envelope>>>>;

/// A replicator's view of its peers.
pub(crate) struct GossipLinks {
    key: &'static str,
    replica: Replica,
    peers: PeerTable,
}

impl GossipLinks {
    pub(crate) fn new(key: &'static str, replica: Replica, peers: PeerTable) -> Self {
        Self { key, replica, peers }
    }

    /// Send to every peer except ourselves; returns who was addressed.
    fn broadcast(&self, bytes: &[u8]) -> Vec<Replica> {
        let peers = self.peers.read();
        let mut addressed = Vec::new();
        for (name, tx) in peers.iter() {
            if *name == self.replica {
                continue;
            }
            self.dispatch(name, tx, bytes.to_vec());
            addressed.push(name.clone());
        }
        addressed
    }

    fn send_to(&self, peer: &Replica, bytes: Vec<u8>) {
        let peers = self.peers.read();
        if let Some(tx) = peers.get(peer) {
            self.dispatch(peer, tx, bytes);
        }
    }

    fn dispatch(&self, peer: &Replica, tx: &mpsc::Sender<Envelope>, bytes: Vec<u8>) {
        let envelope = Envelope {
            from: self.replica.clone(),
            bytes,
        };
        if tx.try_send(envelope).is_err() {
            tracing::trace!(key = self.key, peer = %peer, "gossip inbox unavailable, dropping");
        }
    }

    fn peer_names(&self) -> Vec<Replica> {
        self.peers
            .read()
            .keys()
            .filter(|name| **name != self.replica)
            .cloned()
            .collect()
    }

    fn random_peer(&self) -> Option<Replica> {
        self.peer_names().choose(&mut rand::thread_rng()).cloned()
    }
}

/// Settings for one replicator instance.
#[derive(Debug, Clone)]
pub(crate) struct ReplicatorSettings {
    pub key: &'static str,
    pub replica: Replica,
    pub gossip_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub mailbox_capacity: usize,
}

#[derive(Serialize, Deserialize)]
enum GossipPayload<T> {
    /// A delta to merge. `seq` is set when the sender wants an ack
    /// (write-all bookkeeping).
    Delta {
        seq: Option<u64>,
        delta: SetDelta<T>,
    },
    /// Acknowledges a sequenced delta.
    Ack { seq: u64 },
    /// Anti-entropy: asks the peer for everything past our context.
    SyncRequest { context: HashMap<Replica, Clock> },
    /// Anti-entropy reply.
    SyncResponse { delta: SetDelta<T> },
}

type Mutation<T> = Box<dyn FnOnce(&mut OrSet<T>) + Send>;

enum Command<T> {
    Update {
        write: WriteConsistency,
        apply: Mutation<T>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Get {
        reply: oneshot::Sender<Vec<T>>,
    },
    Watch {
        reply: oneshot::Sender<mpsc::Receiver<Vec<T>>>,
    },
    WriteExpired {
        seq: u64,
    },
}

/// Handle to a replicator actor.
///
/// - `get` returns the most recently merged local value; replica failures
///   degrade to the last known state, never an error.
/// - `update` applies a closure to the local replica and replicates per the
///   chosen [`WriteConsistency`].
/// - `subscribe_to_changes` yields every successive merged snapshot until
///   the receiver is dropped; dropping it is the only teardown.
pub struct Replicator<T> {
    tx: mpsc::Sender<Command<T>>,
    read_timeout: Duration,
}

impl<T> Clone for Replicator<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            read_timeout: self.read_timeout,
        }
    }
}

impl<T> Replicator<T>
where
    T: Clone + Eq + Hash + Debug + Send + Serialize + DeserializeOwned + 'static,
{
    /// Spawn the replicator task for one store key.
    pub(crate) fn spawn(
        settings: ReplicatorSettings,
        links: GossipLinks,
        inbound: mpsc::Receiver<Envelope>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.mailbox_capacity);
        let handle = Self {
            tx: tx.clone(),
            read_timeout: settings.read_timeout,
        };
        let worker = Worker {
            set: OrSet::new(settings.replica.clone()),
            links,
            watchers: Vec::new(),
            pending: HashMap::new(),
            next_seq: 0,
            cmd_tx: tx,
            settings,
        };
        tokio::spawn(worker.run(rx, inbound));
        handle
    }

    /// Read-local snapshot of the merged set, bounded by the read timeout.
    pub async fn get(&self) -> Result<Vec<T>, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Get { reply })
            .await
            .map_err(|_| Error::CoordinatorClosed)?;
        match tokio::time::timeout(self.read_timeout, rx).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(Error::CoordinatorClosed),
            Err(_) => Err(Error::Timeout(self.read_timeout)),
        }
    }

    /// Apply a mutation to the local replica and replicate it.
    ///
    /// Resolves once the consistency level is satisfied; a write-all that
    /// cannot reach every peer fails with [`Error::Timeout`] after the write
    /// timeout. Callers own retries.
    pub async fn update(
        &self,
        write: WriteConsistency,
        apply: impl FnOnce(&mut OrSet<T>) + Send + 'static,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Update {
                write,
                apply: Box::new(apply),
                reply,
            })
            .await
            .map_err(|_| Error::CoordinatorClosed)?;
        rx.await.map_err(|_| Error::CoordinatorClosed)?
    }

    /// Subscribe to merged snapshots. The current value is delivered first,
    /// then every successive merge.
    pub async fn subscribe_to_changes(&self) -> Result<mpsc::Receiver<Vec<T>>, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Watch { reply })
            .await
            .map_err(|_| Error::CoordinatorClosed)?;
        rx.await.map_err(|_| Error::CoordinatorClosed)
    }
}

struct PendingWrite {
    remaining: HashSet<Replica>,
    reply: oneshot::Sender<Result<(), Error>>,
}

struct Worker<T> {
    set: OrSet<T>,
    links: GossipLinks,
    watchers: Vec<mpsc::Sender<Vec<T>>>,
    pending: HashMap<u64, PendingWrite>,
    next_seq: u64,
    cmd_tx: mpsc::Sender<Command<T>>,
    settings: ReplicatorSettings,
}

impl<T> Worker<T>
where
    T: Clone + Eq + Hash + Debug + Send + Serialize + DeserializeOwned + 'static,
{
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command<T>>,
        mut inbound: mpsc::Receiver<Envelope>,
    ) {
        let tick = self.settings.gossip_interval.max(Duration::from_millis(1));
        let mut gossip = tokio::time::interval(tick);
        // Anti-entropy repairs lost delta broadcasts at a coarser cadence.
        let mut sync = tokio::time::interval(tick * 10);
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle_gossip(envelope),
                    None => break,
                },
                _ = gossip.tick() => self.flush_delta(),
                _ = sync.tick() => self.anti_entropy(),
            }
        }
        tracing::debug!(
            key = self.settings.key,
            replica = %self.settings.replica,
            "replicator stopped"
        );
    }

    fn handle_command(&mut self, cmd: Command<T>) {
        match cmd {
            Command::Update { write, apply, reply } => {
                apply(&mut self.set);
                self.notify_watchers();
                let Some(delta) = self.set.take_delta() else {
                    // Nothing observable changed (e.g. removing an absent
                    // element); the ack resolves immediately.
                    let _ = reply.send(Ok(()));
                    return;
                };
                match write {
                    WriteConsistency::Local => {
                        if let Some(bytes) = self.encode(&GossipPayload::Delta {
                            seq: None,
                            delta,
                        }) {
                            self.links.broadcast(&bytes);
                        }
                        let _ = reply.send(Ok(()));
                    }
                    WriteConsistency::All => self.write_all(delta, reply),
                }
            }
            Command::Get { reply } => {
                let _ = reply.send(self.set.elements());
            }
            Command::Watch { reply } => {
                let (tx, rx) = mpsc::channel(self.settings.mailbox_capacity);
                // Seed the watcher with the current value.
                let _ = tx.try_send(self.set.elements());
                self.watchers.push(tx);
                let _ = reply.send(rx);
            }
            Command::WriteExpired { seq } => {
                if let Some(pending) = self.pending.remove(&seq) {
                    tracing::warn!(
                        key = self.settings.key,
                        seq,
                        unacked = pending.remaining.len(),
                        "write-all timed out"
                    );
                    let _ = pending
                        .reply
                        .send(Err(Error::Timeout(self.settings.write_timeout)));
                }
            }
        }
    }

    fn write_all(&mut self, delta: SetDelta<T>, reply: oneshot::Sender<Result<(), Error>>) {
        let peers = self.links.peer_names();
        if peers.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let Some(bytes) = self.encode(&GossipPayload::Delta {
            seq: Some(seq),
            delta,
        }) else {
            let _ = reply.send(Ok(()));
            return;
        };
        for peer in &peers {
            self.links.send_to(peer, bytes.clone());
        }
        self.pending.insert(
            seq,
            PendingWrite {
                remaining: peers.into_iter().collect(),
                reply,
            },
        );
        let cmd_tx = self.cmd_tx.clone();
        let timeout = self.settings.write_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = cmd_tx.send(Command::WriteExpired { seq }).await;
        });
    }

    fn handle_gossip(&mut self, envelope: Envelope) {
        let payload: GossipPayload<T> = match postcard::from_bytes(&envelope.bytes) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    key = self.settings.key,
                    from = %envelope.from,
                    %err,
                    "unrecognized gossip payload dropped"
                );
                return;
            }
        };
        match payload {
            GossipPayload::Delta { seq, delta } => {
                let outcome = self.set.merge(&delta);
                if !outcome.is_empty() {
                    self.notify_watchers();
                }
                if let Some(seq) = seq {
                    if let Some(bytes) = self.encode(&GossipPayload::Ack { seq }) {
                        self.links.send_to(&envelope.from, bytes);
                    }
                }
            }
            GossipPayload::Ack { seq } => {
                let acked = match self.pending.get_mut(&seq) {
                    Some(pending) => {
                        pending.remaining.remove(&envelope.from);
                        pending.remaining.is_empty()
                    }
                    None => false,
                };
                if acked {
                    if let Some(pending) = self.pending.remove(&seq) {
                        let _ = pending.reply.send(Ok(()));
                    }
                }
            }
            GossipPayload::SyncRequest { context } => {
                let delta = self.set.extract(&context);
                if !delta.is_empty() {
                    if let Some(bytes) = self.encode(&GossipPayload::SyncResponse { delta }) {
                        self.links.send_to(&envelope.from, bytes);
                    }
                }
            }
            GossipPayload::SyncResponse { delta } => {
                let outcome = self.set.merge(&delta);
                if !outcome.is_empty() {
                    self.notify_watchers();
                }
            }
        }
    }

    fn flush_delta(&mut self) {
        if let Some(delta) = self.set.take_delta() {
            if let Some(bytes) = self.encode(&GossipPayload::Delta { seq: None, delta }) {
                self.links.broadcast(&bytes);
            }
        }
    }

    fn anti_entropy(&mut self) {
        if let Some(peer) = self.links.random_peer() {
            let request = GossipPayload::SyncRequest {
                context: self.set.context().clone(),
            };
            if let Some(bytes) = self.encode(&request) {
                self.links.send_to(&peer, bytes);
            }
        }
    }

    fn notify_watchers(&mut self) {
        if self.watchers.is_empty() {
            return;
        }
        let snapshot = self.set.elements();
        self.watchers.retain(|watcher| {
            match watcher.try_send(snapshot.clone()) {
                Ok(()) => true,
                // A slow watcher keeps its slot; it catches up on the next
                // merge. A dropped receiver is the unsubscribe signal.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn encode(&self, payload: &GossipPayload<T>) -> Option<Vec<u8>> {
        match postcard::to_allocvec(payload) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::error!(key = self.settings.key, %err, "failed to encode gossip payload");
                None
            }
        }
    }
}
