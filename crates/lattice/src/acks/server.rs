//! The acknowledgement-label coordinator actor.

use super::{AckDeclaration, AckLabelArbiter};
use crate::ddata::{Replicator, WriteConsistency};
use crate::error::Error;
use crate::subscriber::{Delivery, SubscriberId, SubscriberRef};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

enum AckCmd {
    Declare {
        labels: Vec<String>,
        subscriber: SubscriberRef,
        group: Option<String>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Relinquish {
        subscriber: SubscriberId,
    },
}

pub(crate) struct AckSettings {
    pub replica: String,
    pub write: WriteConsistency,
    pub ask_timeout: Duration,
    pub mailbox_capacity: usize,
}

/// Handle to the node's acknowledgement-label coordinator.
#[derive(Clone)]
pub struct AckCoordinator {
    tx: mpsc::Sender<AckCmd>,
    store: Replicator<AckDeclaration>,
    ask_timeout: Duration,
}

/// Spawn the coordinator over the distributed declaration store.
pub(crate) async fn spawn_ack_coordinator(
    settings: AckSettings,
    store: Replicator<AckDeclaration>,
) -> Result<AckCoordinator, Error> {
    let changes = store.subscribe_to_changes().await?;
    let (tx, rx) = mpsc::channel(settings.mailbox_capacity);
    let ask_timeout = settings.ask_timeout;
    let worker = Worker {
        store: store.clone(),
        local: HashMap::new(),
        local_refs: HashMap::new(),
        view: Vec::new(),
        seq: 0,
        self_tx: tx.clone(),
        settings,
    };
    tokio::spawn(worker.run(rx, changes));
    Ok(AckCoordinator {
        tx,
        store,
        ask_timeout,
    })
}

#[async_trait]
impl AckLabelArbiter for AckCoordinator {
    async fn declare(
        &self,
        labels: Vec<String>,
        subscriber: &SubscriberRef,
        group: Option<String>,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AckCmd::Declare {
                labels,
                subscriber: subscriber.clone(),
                group,
                reply,
            })
            .await
            .map_err(|_| Error::CoordinatorClosed)?;
        match tokio::time::timeout(self.ask_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::CoordinatorClosed),
            Err(_) => Err(Error::Timeout(self.ask_timeout)),
        }
    }

    fn relinquish(&self, subscriber: &SubscriberId) {
        if self
            .tx
            .try_send(AckCmd::Relinquish {
                subscriber: subscriber.clone(),
            })
            .is_err()
        {
            tracing::warn!("ack coordinator mailbox unavailable, dropping relinquish");
        }
    }

    async fn watch_declarations(&self) -> Result<mpsc::Receiver<Vec<AckDeclaration>>, Error> {
        self.store.subscribe_to_changes().await
    }
}

struct Worker {
    store: Replicator<AckDeclaration>,
    /// Labels owned by this node's subscribers: the locally declared view.
    local: HashMap<String, AckDeclaration>,
    /// Live handles for conflict notification, keyed by declarer.
    local_refs: HashMap<SubscriberId, SubscriberRef>,
    /// Last merged distributed view.
    view: Vec<AckDeclaration>,
    seq: u64,
    self_tx: mpsc::Sender<AckCmd>,
    settings: AckSettings,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<AckCmd>,
        mut changes: mpsc::Receiver<Vec<AckDeclaration>>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(AckCmd::Declare { labels, subscriber, group, reply }) => {
                        let result = self.declare(labels, subscriber, group).await;
                        let _ = reply.send(result);
                    }
                    Some(AckCmd::Relinquish { subscriber }) => {
                        self.relinquish(subscriber).await;
                    }
                    None => break,
                },
                snapshot = changes.recv() => match snapshot {
                    Some(snapshot) => self.on_view_changed(snapshot).await,
                    None => break,
                },
            }
        }
        tracing::debug!(replica = %self.settings.replica, "ack coordinator stopped");
    }

    /// The currently-known owner of a label, preferring our authoritative
    /// local view over the (possibly lagging) distributed one.
    fn current_owner(&self, label: &str) -> Option<&AckDeclaration> {
        self.local
            .get(label)
            .or_else(|| self.view.iter().find(|d| d.label == label))
    }

    async fn declare(
        &mut self,
        labels: Vec<String>,
        subscriber: SubscriberRef,
        group: Option<String>,
    ) -> Result<(), Error> {
        let declarer = subscriber.id().clone();

        // All-or-nothing: one taken label fails the whole batch before
        // anything commits.
        for label in &labels {
            if let Some(owner) = self.current_owner(label) {
                if owner.subscriber != declarer {
                    tracing::debug!(
                        label = %label,
                        declarer = %declarer,
                        owner = %owner.subscriber,
                        "declaration rejected, label already owned"
                    );
                    return Err(Error::AckLabelNotUnique {
                        label: label.clone(),
                        owner: owner.subscriber.clone(),
                    });
                }
            }
        }

        self.seq += 1;
        let declarations: Vec<AckDeclaration> = labels
            .iter()
            .map(|label| AckDeclaration {
                label: label.clone(),
                subscriber: declarer.clone(),
                group: group.clone(),
                origin: self.settings.replica.clone(),
                seq: self.seq,
            })
            .collect();

        let replicated = declarations.clone();
        self.store
            .update(self.settings.write, move |set| {
                for declaration in replicated {
                    // Re-declaration by the same subscriber replaces its
                    // previous entry for the label.
                    set.remove_where(|d| {
                        d.label == declaration.label && d.subscriber == declaration.subscriber
                    });
                    set.insert(declaration);
                }
            })
            .await?;

        for declaration in declarations {
            self.local.insert(declaration.label.clone(), declaration);
        }
        self.watch(subscriber);
        tracing::debug!(declarer = %declarer, labels = ?labels, "acknowledgement labels declared");
        Ok(())
    }

    async fn relinquish(&mut self, subscriber: SubscriberId) {
        self.local.retain(|_, d| d.subscriber != subscriber);
        self.local_refs.remove(&subscriber);

        let id = subscriber.clone();
        let result = self
            .store
            .update(self.settings.write, move |set| {
                set.remove_where(|d| d.subscriber == id);
            })
            .await;
        match result {
            Ok(()) => tracing::debug!(subscriber = %subscriber, "acknowledgement labels relinquished"),
            Err(err) => tracing::warn!(subscriber = %subscriber, %err, "relinquish failed"),
        }
    }

    /// Scan a merged snapshot for labels with more than one claimed owner
    /// and resolve each collision the same way on every replica: the lowest
    /// `(seq, origin, subscriber)` survives. When one of our subscribers
    /// lost, withdraw its declaration and hand it the failure signal.
    async fn on_view_changed(&mut self, snapshot: Vec<AckDeclaration>) {
        self.view = snapshot;

        let mut by_label: HashMap<&str, Vec<&AckDeclaration>> = HashMap::new();
        for declaration in &self.view {
            by_label
                .entry(declaration.label.as_str())
                .or_default()
                .push(declaration);
        }

        let mut lost: Vec<(AckDeclaration, SubscriberId)> = Vec::new();
        for (label, claims) in by_label {
            let distinct = claims
                .iter()
                .map(|d| &d.subscriber)
                .collect::<std::collections::HashSet<_>>()
                .len();
            if distinct < 2 {
                continue;
            }
            let winner = claims
                .iter()
                .min_by_key(|d| (d.seq, d.origin.clone(), d.subscriber.clone()))
                .expect("non-empty claim list");
            if let Some(ours) = self.local.get(label) {
                if ours.subscriber != winner.subscriber {
                    lost.push((ours.clone(), winner.subscriber.clone()));
                }
            }
        }

        for (declaration, winner) in lost {
            tracing::info!(
                label = %declaration.label,
                loser = %declaration.subscriber,
                winner = %winner,
                "acknowledgement label lost concurrent declaration race"
            );
            self.local.remove(&declaration.label);

            let withdrawn = declaration.clone();
            let result = self
                .store
                .update(self.settings.write, move |set| {
                    set.remove_where(|d| {
                        d.label == withdrawn.label && d.subscriber == withdrawn.subscriber
                    });
                })
                .await;
            if let Err(err) = result {
                tracing::warn!(label = %declaration.label, %err, "failed to withdraw lost declaration");
            }

            if let Some(handle) = self.local_refs.get(&declaration.subscriber) {
                handle.deliver(Delivery::AckLabelNotUnique {
                    label: declaration.label,
                    owner: winner,
                });
            }
        }
    }

    fn watch(&mut self, subscriber: SubscriberRef) {
        let id = subscriber.id().clone();
        if self.local_refs.insert(id.clone(), subscriber.clone()).is_some() {
            return;
        }
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            subscriber.closed().await;
            let _ = tx.send(AckCmd::Relinquish { subscriber: id }).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddata::replicator::{GossipLinks, PeerTable, ReplicatorSettings};
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn spawn_store(table: &PeerTable, replica: &str) -> Replicator<AckDeclaration> {
        let (tx, rx) = mpsc::channel(64);
        table.write().insert(replica.to_string(), tx);
        Replicator::spawn(
            ReplicatorSettings {
                key: "ack-labels",
                replica: replica.to_string(),
                gossip_interval: Duration::from_millis(20),
                read_timeout: Duration::from_millis(500),
                write_timeout: Duration::from_millis(500),
                mailbox_capacity: 64,
            },
            GossipLinks::new("ack-labels", replica.to_string(), Arc::clone(table)),
            rx,
        )
    }

    async fn spawn_coordinator(table: &PeerTable, replica: &str) -> AckCoordinator {
        let store = spawn_store(table, replica);
        spawn_ack_coordinator(
            AckSettings {
                replica: replica.to_string(),
                write: WriteConsistency::Local,
                ask_timeout: Duration::from_secs(1),
                mailbox_capacity: 64,
            },
            store,
        )
        .await
        .unwrap()
    }

    fn subscriber(replica: &str, seq: u64) -> (SubscriberRef, mpsc::Receiver<Delivery>) {
        SubscriberRef::channel(SubscriberId::new(replica, seq), 16)
    }

    #[tokio::test]
    async fn test_second_local_declaration_fails() {
        let table: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let coordinator = spawn_coordinator(&table, "node-a").await;
        let (s1, _rx1) = subscriber("node-a", 1);
        let (s2, _rx2) = subscriber("node-a", 2);

        coordinator
            .declare(vec!["persisted".into()], &s1, None)
            .await
            .unwrap();
        let err = coordinator
            .declare(vec!["persisted".into()], &s2, None)
            .await
            .unwrap_err();
        match err {
            Error::AckLabelNotUnique { label, owner } => {
                assert_eq!(label, "persisted");
                assert_eq!(owner, *s1.id());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let table: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let store = spawn_store(&table, "probe");
        let coordinator = spawn_coordinator(&table, "node-a").await;
        let (s1, _rx1) = subscriber("node-a", 1);
        let (s2, _rx2) = subscriber("node-a", 2);

        coordinator
            .declare(vec!["persisted".into(), "indexed".into()], &s1, None)
            .await
            .unwrap();
        let err = coordinator
            .declare(vec!["fresh".into(), "indexed".into()], &s2, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AckLabelNotUnique { .. }));

        // The free label of the failed batch must not have been committed.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let declarations = store.get().await.unwrap();
        assert!(declarations.iter().all(|d| d.label != "fresh"));
    }

    #[tokio::test]
    async fn test_redeclaration_by_owner_succeeds() {
        let table: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let coordinator = spawn_coordinator(&table, "node-a").await;
        let (s1, _rx1) = subscriber("node-a", 1);

        coordinator
            .declare(vec!["persisted".into()], &s1, None)
            .await
            .unwrap();
        coordinator
            .declare(vec!["persisted".into()], &s1, Some("g1".into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_relinquish_frees_labels() {
        let table: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let coordinator = spawn_coordinator(&table, "node-a").await;
        let (s1, _rx1) = subscriber("node-a", 1);
        let (s2, _rx2) = subscriber("node-a", 2);

        coordinator
            .declare(vec!["persisted".into()], &s1, None)
            .await
            .unwrap();
        coordinator.relinquish(s1.id());

        let mut freed = false;
        for _ in 0..100 {
            if coordinator
                .declare(vec!["persisted".into()], &s2, None)
                .await
                .is_ok()
            {
                freed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(freed, "label was not freed by relinquish");
    }

    #[tokio::test]
    async fn test_termination_watch_relinquishes() {
        let table: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let coordinator = spawn_coordinator(&table, "node-a").await;
        let (s1, rx1) = subscriber("node-a", 1);
        let (s2, _rx2) = subscriber("node-a", 2);

        coordinator
            .declare(vec!["persisted".into()], &s1, None)
            .await
            .unwrap();
        drop(rx1);

        let mut freed = false;
        for _ in 0..100 {
            if coordinator
                .declare(vec!["persisted".into()], &s2, None)
                .await
                .is_ok()
            {
                freed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(freed, "termination did not relinquish the label");
    }

    #[tokio::test]
    async fn test_cross_node_race_has_one_survivor() {
        let table: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let a = spawn_coordinator(&table, "node-a").await;
        let b = spawn_coordinator(&table, "node-b").await;
        let (s1, mut rx1) = subscriber("node-a", 1);
        let (s2, mut rx2) = subscriber("node-b", 1);

        // Both nodes accept the declaration before gossip reveals the race.
        a.declare(vec!["persisted".into()], &s1, None).await.unwrap();
        b.declare(vec!["persisted".into()], &s2, None).await.unwrap();

        // Exactly one of the two subscribers must be told it lost.
        let conflict = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                tokio::select! {
                    Some(delivery) = rx1.recv() => {
                        if let Delivery::AckLabelNotUnique { label, .. } = delivery {
                            break ("s1", label);
                        }
                    }
                    Some(delivery) = rx2.recv() => {
                        if let Delivery::AckLabelNotUnique { label, .. } = delivery {
                            break ("s2", label);
                        }
                    }
                }
            }
        })
        .await
        .expect("no conflict notification arrived");
        assert_eq!(conflict.1, "persisted");

        // After convergence exactly one declaration remains.
        let store = spawn_store(&table, "probe");
        let mut converged = false;
        for _ in 0..200 {
            let declarations = store.get().await.unwrap();
            let owners: std::collections::HashSet<_> = declarations
                .iter()
                .filter(|d| d.label == "persisted")
                .map(|d| d.subscriber.clone())
                .collect();
            if owners.len() == 1 {
                converged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(converged, "declarations did not converge to one owner");
    }
}
