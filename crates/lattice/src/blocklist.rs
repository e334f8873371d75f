//! The replicated namespace blocklist and its guard behavior.
//!
//! A single-shard replicated set of namespace strings; the working set is
//! small and changes rarely, so there is no partitioning. Membership checks
//! read the local replica and fail open: a check that cannot get an answer
//! behaves as "not blocked", trading strictness for availability. Writes go
//! to every replica so an administrative block takes effect cluster-wide
//! before the command returns.

use crate::ddata::{Replicator, WriteConsistency};
use crate::error::Error;
use crate::signal::Signal;

/// Handle to the node's blocklist replica.
#[derive(Clone)]
pub struct BlockedNamespaces {
    store: Replicator<String>,
}

impl BlockedNamespaces {
    pub(crate) fn new(store: Replicator<String>) -> Self {
        Self { store }
    }

    /// Whether the namespace is blocked according to the local replica.
    ///
    /// Never fails: read errors degrade to `false`. The answer may lag true
    /// cluster state by up to one gossip round.
    pub async fn contains(&self, namespace: &str) -> bool {
        match self.store.get().await {
            Ok(namespaces) => namespaces.iter().any(|ns| ns == namespace),
            Err(err) => {
                tracing::warn!(%namespace, %err, "blocklist read failed, treating as not blocked");
                false
            }
        }
    }

    /// Block a namespace, waiting for full propagation.
    pub async fn add(&self, namespace: impl Into<String>) -> Result<(), Error> {
        let namespace = namespace.into();
        self.store
            .update(WriteConsistency::All, move |set| {
                if !set.contains(&namespace) {
                    set.insert(namespace);
                }
            })
            .await
    }

    /// Unblock a namespace, waiting for full propagation.
    pub async fn remove(&self, namespace: &str) -> Result<(), Error> {
        let namespace = namespace.to_string();
        self.store
            .update(WriteConsistency::All, move |set| {
                set.remove(&namespace);
            })
            .await
    }

    /// Gate a signal on the blocklist.
    ///
    /// Signals not addressed to an entity pass through without a lookup.
    /// A blocked namespace fails with [`Error::NamespaceBlocked`] carrying
    /// the signal's original headers; everything else passes unchanged.
    pub async fn block(&self, signal: Signal) -> Result<Signal, Error> {
        let Some(entity) = signal.entity() else {
            return Ok(signal);
        };
        let namespace = entity.namespace().to_string();
        if self.contains(&namespace).await {
            tracing::debug!(%namespace, "rejecting signal for blocked namespace");
            return Err(Error::NamespaceBlocked {
                namespace,
                headers: signal.headers().clone(),
            });
        }
        Ok(signal)
    }
}
