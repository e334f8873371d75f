//! The subscriber-registry coordinator.
//!
//! One per node. Owns every mutation of the node's topic-registry replica,
//! keeps the node-local filter table, and watches subscriber handles so a
//! terminated subscriber is cleaned up exactly like an explicitly removed
//! one.

use super::types::{FilterTable, SubscribeOptions, Subscription};
use crate::ddata::{Replicator, WriteConsistency};
use crate::error::Error;
use crate::subscriber::{Resolver, SubscriberId, SubscriberRef};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

type Ack = oneshot::Sender<Result<(), Error>>;

enum Request {
    Subscribe {
        topics: Vec<String>,
        subscriber: SubscriberRef,
        options: SubscribeOptions,
        reply: Option<Ack>,
    },
    Unsubscribe {
        topics: Vec<String>,
        subscriber: SubscriberId,
        reply: Option<Ack>,
    },
    RemoveSubscriber {
        subscriber: SubscriberId,
    },
}

pub(crate) struct RegistrySettings {
    pub write: WriteConsistency,
    pub propagation_delay: Duration,
    pub ask_timeout: Duration,
    pub mailbox_capacity: usize,
}

/// Handle to the node's subscriber-registry coordinator.
///
/// Acked operations resolve once the local replica write has committed —
/// plus the configured propagation delay, which bounds (without
/// eliminating) the window in which a remote publisher can still miss the
/// new entry. Fire-and-forget variants exist for hot paths.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    tx: mpsc::Sender<Request>,
    ask_timeout: Duration,
}

pub(crate) fn spawn_registry(
    settings: RegistrySettings,
    store: Replicator<Subscription>,
    filters: FilterTable,
    resolver: Resolver,
) -> SubscriptionRegistry {
    let (tx, rx) = mpsc::channel(settings.mailbox_capacity);
    let ask_timeout = settings.ask_timeout;
    let worker = Worker {
        store,
        filters,
        resolver,
        generations: HashMap::new(),
        watched: HashSet::new(),
        self_tx: tx.clone(),
        settings,
    };
    tokio::spawn(worker.run(rx));
    SubscriptionRegistry { tx, ask_timeout }
}

impl SubscriptionRegistry {
    /// Subscribe to the given topics, waiting for the ack.
    pub async fn subscribe(
        &self,
        topics: Vec<String>,
        subscriber: &SubscriberRef,
        options: SubscribeOptions,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            Request::Subscribe {
                topics,
                subscriber: subscriber.clone(),
                options,
                reply: Some(reply),
            },
            rx,
        )
        .await
    }

    /// Subscribe without waiting for delivery confirmation.
    pub fn subscribe_no_ack(
        &self,
        topics: Vec<String>,
        subscriber: &SubscriberRef,
        options: SubscribeOptions,
    ) {
        self.cast(Request::Subscribe {
            topics,
            subscriber: subscriber.clone(),
            options,
            reply: None,
        });
    }

    /// Unsubscribe from the given topics, waiting for the ack.
    pub async fn unsubscribe(
        &self,
        topics: Vec<String>,
        subscriber: &SubscriberRef,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            Request::Unsubscribe {
                topics,
                subscriber: subscriber.id().clone(),
                reply: Some(reply),
            },
            rx,
        )
        .await
    }

    /// Unsubscribe without waiting for confirmation.
    pub fn unsubscribe_no_ack(&self, topics: Vec<String>, subscriber: &SubscriberRef) {
        self.cast(Request::Unsubscribe {
            topics,
            subscriber: subscriber.id().clone(),
            reply: None,
        });
    }

    /// Relinquish all of a subscriber's entries at once. Fire-and-forget;
    /// also triggered automatically when the subscriber's handle terminates.
    pub fn remove_subscriber(&self, subscriber: &SubscriberId) {
        self.cast(Request::RemoveSubscriber {
            subscriber: subscriber.clone(),
        });
    }

    async fn ask(
        &self,
        request: Request,
        rx: oneshot::Receiver<Result<(), Error>>,
    ) -> Result<(), Error> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::CoordinatorClosed)?;
        match tokio::time::timeout(self.ask_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::CoordinatorClosed),
            Err(_) => Err(Error::Timeout(self.ask_timeout)),
        }
    }

    fn cast(&self, request: Request) {
        if self.tx.try_send(request).is_err() {
            tracing::warn!("subscription registry mailbox unavailable, dropping request");
        }
    }
}

struct Worker {
    store: Replicator<Subscription>,
    filters: FilterTable,
    resolver: Resolver,
    generations: HashMap<SubscriberId, u64>,
    watched: HashSet<SubscriberId>,
    self_tx: mpsc::Sender<Request>,
    settings: RegistrySettings,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(request) = rx.recv().await {
            match request {
                Request::Subscribe {
                    topics,
                    subscriber,
                    options,
                    reply,
                } => {
                    let result = self.subscribe(topics, subscriber, options).await;
                    self.ack(reply, result);
                }
                Request::Unsubscribe {
                    topics,
                    subscriber,
                    reply,
                } => {
                    let result = self.unsubscribe(topics, subscriber).await;
                    self.ack(reply, result);
                }
                Request::RemoveSubscriber { subscriber } => {
                    self.remove_subscriber(subscriber).await;
                }
            }
        }
    }

    async fn subscribe(
        &mut self,
        topics: Vec<String>,
        subscriber: SubscriberRef,
        options: SubscribeOptions,
    ) -> Result<(), Error> {
        let id = subscriber.id().clone();
        self.resolver.insert(id.clone(), subscriber.clone());
        if let Some(filter) = options.filter {
            self.filters.insert(id.clone(), filter);
        }

        let generation = {
            let entry = self.generations.entry(id.clone()).or_insert(0);
            if options.resubscribe {
                *entry += 1;
            }
            *entry
        };

        tracing::debug!(
            subscriber = %id,
            topics = ?topics,
            group = ?options.group,
            generation,
            resubscribe = options.resubscribe,
            "subscribing"
        );

        let group = options.group;
        let resubscribe = options.resubscribe;
        let entry_id = id.clone();
        let topic_set: BTreeSet<String> = topics.iter().cloned().collect();
        self.store
            .update(self.settings.write, move |set| {
                if resubscribe {
                    set.remove_where(|s| {
                        s.subscriber == entry_id
                            && s.generation < generation
                            && topic_set.contains(&s.topic)
                    });
                }
                for topic in topics {
                    let entry = Subscription {
                        topic,
                        subscriber: entry_id.clone(),
                        group: group.clone(),
                        generation,
                    };
                    if !set.contains(&entry) {
                        set.insert(entry);
                    }
                }
            })
            .await?;

        self.watch(subscriber);
        Ok(())
    }

    async fn unsubscribe(
        &mut self,
        topics: Vec<String>,
        subscriber: SubscriberId,
    ) -> Result<(), Error> {
        tracing::debug!(subscriber = %subscriber, topics = ?topics, "unsubscribing");
        let topic_set: BTreeSet<String> = topics.into_iter().collect();
        self.store
            .update(self.settings.write, move |set| {
                set.remove_where(|s| s.subscriber == subscriber && topic_set.contains(&s.topic));
            })
            .await
    }

    async fn remove_subscriber(&mut self, subscriber: SubscriberId) {
        self.resolver.remove(&subscriber);
        self.filters.remove(&subscriber);
        self.generations.remove(&subscriber);
        self.watched.remove(&subscriber);

        let id = subscriber.clone();
        let result = self
            .store
            .update(self.settings.write, move |set| {
                set.remove_where(|s| s.subscriber == id);
            })
            .await;
        match result {
            Ok(()) => tracing::debug!(subscriber = %subscriber, "removed subscriber"),
            Err(err) => {
                tracing::warn!(subscriber = %subscriber, %err, "failed to remove subscriber")
            }
        }
    }

    /// Register the termination watch once per subscriber. Termination feeds
    /// the same removal path as an explicit request, so processing it after
    /// an explicit removal is a no-op.
    fn watch(&mut self, subscriber: SubscriberRef) {
        if !self.watched.insert(subscriber.id().clone()) {
            return;
        }
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            subscriber.closed().await;
            let _ = tx
                .send(Request::RemoveSubscriber {
                    subscriber: subscriber.id().clone(),
                })
                .await;
        });
    }

    fn ack(&self, reply: Option<Ack>, result: Result<(), Error>) {
        let Some(reply) = reply else {
            if let Err(err) = result {
                tracing::debug!(%err, "fire-and-forget registry request failed");
            }
            return;
        };
        match result {
            Ok(()) if !self.settings.propagation_delay.is_zero() => {
                let delay = self.settings.propagation_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = reply.send(Ok(()));
                });
            }
            other => {
                let _ = reply.send(other);
            }
        }
    }
}
