//! Multi-node scenarios over the in-process fabric.

use lattice::signal::{headers, TOPICS_HEADER};
use lattice::subscriber::Delivery;
use lattice::{
    AckRole, Cluster, EntityId, Error, Node, NodeConfig, PublishedSignal, Signal, SubscribeOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;

fn fast_config(name: &str) -> NodeConfig {
    NodeConfig::new(name)
        .gossip_interval(Duration::from_millis(10))
        .ask_timeout(Duration::from_secs(2))
        .write_timeout(Duration::from_millis(500))
}

async fn two_nodes() -> (Cluster, Node, Node) {
    let cluster = Cluster::new();
    let a = cluster.join(fast_config("node-a")).await.unwrap();
    let b = cluster.join(fast_config("node-b")).await.unwrap();
    (cluster, a, b)
}

fn event(topic: &str) -> Signal {
    Signal::new("events:thing-modified").header(TOPICS_HEADER, topic)
}

async fn recv_published(
    rx: &mut mpsc::Receiver<Delivery>,
    wait: Duration,
) -> Option<PublishedSignal> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(Delivery::Signal(published))) => return Some(published),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

#[tokio::test]
async fn subscribe_then_publish_crosses_nodes() {
    let (_cluster, a, b) = two_nodes().await;

    let (subscriber, mut inbox) = b.subscriber(64);
    b.subscriptions()
        .subscribe(vec!["room.events".into()], &subscriber, SubscribeOptions::new())
        .await
        .unwrap();

    // The local write has committed; the remote publisher sees it within
    // the propagation window. Publish until the first delivery lands.
    let mut delivered = None;
    for _ in 0..100 {
        a.publisher().publish(event("room.events"), "room-42").await.unwrap();
        if let Some(published) = recv_published(&mut inbox, Duration::from_millis(50)).await {
            delivered = Some(published);
            break;
        }
    }
    let published = delivered.expect("subscriber never received the publish");
    assert!(published.topics.contains("room.events"));
    assert!(published.acks.is_none());
}

#[tokio::test]
async fn group_routes_all_keyed_messages_to_one_subscriber() {
    let cluster = Cluster::new();
    let a = cluster.join(fast_config("node-a")).await.unwrap();

    let (s1, mut inbox1) = a.subscriber(256);
    let (s2, mut inbox2) = a.subscriber(256);
    for subscriber in [&s1, &s2] {
        a.subscriptions()
            .subscribe(
                vec!["room.events".into()],
                subscriber,
                SubscribeOptions::new().group("g1"),
            )
            .await
            .unwrap();
    }

    for _ in 0..100 {
        a.publisher().publish(event("room.events"), "room-42").await.unwrap();
    }

    // All 100 must land on the same one of {s1, s2}, never split.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut count1 = 0;
    while recv_published(&mut inbox1, Duration::from_millis(20)).await.is_some() {
        count1 += 1;
    }
    let mut count2 = 0;
    while recv_published(&mut inbox2, Duration::from_millis(20)).await.is_some() {
        count2 += 1;
    }
    assert_eq!(count1 + count2, 100);
    assert!(
        count1 == 100 || count2 == 100,
        "group deliveries split: {count1}/{count2}"
    );
}

#[tokio::test]
async fn changing_group_key_is_deterministic() {
    let cluster = Cluster::new();
    let a = cluster.join(fast_config("node-a")).await.unwrap();

    let (s1, mut inbox1) = a.subscriber(256);
    let (s2, mut inbox2) = a.subscriber(256);
    for subscriber in [&s1, &s2] {
        a.subscriptions()
            .subscribe(
                vec!["room.events".into()],
                subscriber,
                SubscribeOptions::new().group("g1"),
            )
            .await
            .unwrap();
    }

    // Two rounds with the same set of keys must produce the same routing.
    let keys: Vec<String> = (0..20).map(|i| format!("room-{i}")).collect();
    let mut rounds: Vec<Vec<(String, u8)>> = Vec::new();
    for _ in 0..2 {
        for key in &keys {
            // Tag the signal type with the key so the routing of every key
            // is individually comparable across rounds.
            let signal = Signal::new(format!("events:{key}")).header(TOPICS_HEADER, "room.events");
            a.publisher().publish(signal, key).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut routed = Vec::new();
        while let Some(published) = recv_published(&mut inbox1, Duration::from_millis(20)).await {
            routed.push((published.signal.signal_type().to_string(), 1u8));
        }
        while let Some(published) = recv_published(&mut inbox2, Duration::from_millis(20)).await {
            routed.push((published.signal.signal_type().to_string(), 2u8));
        }
        routed.sort();
        rounds.push(routed);
    }
    assert_eq!(rounds[0].len(), 20);
    assert_eq!(rounds[0], rounds[1]);
}

#[tokio::test]
async fn unsubscribe_stops_deliveries() {
    let cluster = Cluster::new();
    let a = cluster.join(fast_config("node-a")).await.unwrap();

    let (subscriber, mut inbox) = a.subscriber(64);
    a.subscriptions()
        .subscribe(vec!["room.events".into()], &subscriber, SubscribeOptions::new())
        .await
        .unwrap();

    a.publisher().publish(event("room.events"), "k").await.unwrap();
    assert!(recv_published(&mut inbox, Duration::from_secs(2)).await.is_some());

    a.subscriptions()
        .unsubscribe(vec!["room.events".into()], &subscriber)
        .await
        .unwrap();

    a.publisher().publish(event("room.events"), "k").await.unwrap();
    assert!(
        recv_published(&mut inbox, Duration::from_millis(300)).await.is_none(),
        "delivery after unsubscribe"
    );
}

#[tokio::test]
async fn terminated_subscriber_is_cleaned_up_and_group_rebalances() {
    let cluster = Cluster::new();
    let a = cluster.join(fast_config("node-a")).await.unwrap();

    let (s1, mut inbox1) = a.subscriber(64);
    let (s2, mut inbox2) = a.subscriber(64);
    for subscriber in [&s1, &s2] {
        a.subscriptions()
            .subscribe(
                vec!["room.events".into()],
                subscriber,
                SubscribeOptions::new().group("g1"),
            )
            .await
            .unwrap();
    }

    a.publisher().publish(event("room.events"), "room-42").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Terminate whichever subscriber won the group election.
    let mut survivor_inbox = if recv_published(&mut inbox1, Duration::from_millis(20)).await.is_some() {
        drop(inbox1);
        inbox2
    } else {
        assert!(recv_published(&mut inbox2, Duration::from_millis(20)).await.is_some());
        drop(inbox2);
        inbox1
    };

    // The termination watch removes the dead entry; the group then routes
    // the same key to the survivor.
    let mut rebalanced = false;
    for _ in 0..100 {
        a.publisher().publish(event("room.events"), "room-42").await.unwrap();
        if recv_published(&mut survivor_inbox, Duration::from_millis(50)).await.is_some() {
            rebalanced = true;
            break;
        }
    }
    assert!(rebalanced, "group did not rebalance to the survivor");
}

#[tokio::test]
async fn filter_judges_full_matched_topic_set() {
    let cluster = Cluster::new();
    let a = cluster.join(fast_config("node-a")).await.unwrap();

    let (subscriber, mut inbox) = a.subscriber(64);
    a.subscriptions()
        .subscribe(
            vec!["room.events".into()],
            &subscriber,
            SubscribeOptions::new().filter(|matched| !matched.contains("room.muted")),
        )
        .await
        .unwrap();
    let (muted, _muted_inbox) = a.subscriber(64);
    a.subscriptions()
        .subscribe(vec!["room.muted".into()], &muted, SubscribeOptions::new())
        .await
        .unwrap();

    // Suppressed: the matched set includes the muted topic.
    a.publisher()
        .publish(event("room.events").header(TOPICS_HEADER, "room.events,room.muted"), "k")
        .await
        .unwrap();
    assert!(recv_published(&mut inbox, Duration::from_millis(300)).await.is_none());

    // Allowed: only the subscribed topic matches.
    a.publisher().publish(event("room.events"), "k").await.unwrap();
    assert!(recv_published(&mut inbox, Duration::from_secs(2)).await.is_some());
}

#[tokio::test]
async fn publish_with_acks_attaches_request_metadata() {
    let cluster = Cluster::new();
    let a = cluster.join(fast_config("node-a")).await.unwrap();

    let (subscriber, mut inbox) = a.subscriber(64);
    a.subscriptions()
        .subscribe(vec!["room.events".into()], &subscriber, SubscribeOptions::new())
        .await
        .unwrap();

    let signal = event("room.events")
        .entity_id(EntityId::new("org.acme", "thing-1"))
        .header(headers::REQUESTED_ACKS, "persisted,search-indexed");

    a.publisher().publish_with_acks(signal.clone(), "thing-1").await.unwrap();
    let published = recv_published(&mut inbox, Duration::from_secs(2)).await.unwrap();
    let acks = published.acks.expect("ack request missing");
    assert_eq!(acks.labels, vec!["persisted", "search-indexed"]);
    assert_eq!(acks.entity, Some(EntityId::new("org.acme", "thing-1")));

    // A signal without requested acks degrades to a plain publish.
    a.publisher()
        .publish_with_acks(event("room.events"), "thing-1")
        .await
        .unwrap();
    let published = recv_published(&mut inbox, Duration::from_secs(2)).await.unwrap();
    assert!(published.acks.is_none());

    // Plain publish never attaches metadata, requested or not.
    a.publisher().publish(signal, "thing-1").await.unwrap();
    let published = recv_published(&mut inbox, Duration::from_secs(2)).await.unwrap();
    assert!(published.acks.is_none());
}

#[tokio::test]
async fn concurrent_ack_declarations_leave_one_owner() {
    let (_cluster, a, b) = two_nodes().await;

    let (s1, mut inbox1) = a.subscriber(64);
    let (s2, mut inbox2) = b.subscriber(64);

    a.acks().declare(vec!["persisted".into()], &s1, None).await.unwrap();
    b.acks().declare(vec!["persisted".into()], &s2, None).await.unwrap();

    // Exactly one side observes the uniqueness failure once the
    // distributed view converges.
    let loser = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            tokio::select! {
                Some(delivery) = inbox1.recv() => {
                    if matches!(delivery, Delivery::AckLabelNotUnique { .. }) {
                        break 1;
                    }
                }
                Some(delivery) = inbox2.recv() => {
                    if matches!(delivery, Delivery::AckLabelNotUnique { .. }) {
                        break 2;
                    }
                }
            }
        }
    })
    .await
    .expect("no uniqueness failure was reported");

    // The winner keeps the label: a fresh declaration for it still fails.
    let (s3, _inbox3) = a.subscriber(64);
    let err = a
        .acks()
        .declare(vec!["persisted".into()], &s3, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AckLabelNotUnique { .. }), "loser was {loser}");
}

#[tokio::test]
async fn sequential_declarations_conflict_across_nodes() {
    let (_cluster, a, b) = two_nodes().await;

    let (s1, _inbox1) = a.subscriber(64);
    a.acks().declare(vec!["persisted".into()], &s1, None).await.unwrap();

    // Once the declaration has gossiped, the other node rejects it locally.
    let (s2, _inbox2) = b.subscriber(64);
    let mut rejected = false;
    for _ in 0..100 {
        match b.acks().declare(vec!["persisted".into()], &s2, None).await {
            Err(Error::AckLabelNotUnique { owner, .. }) => {
                assert_eq!(owner, *s1.id());
                rejected = true;
                break;
            }
            // The race window: node-b accepted before the distributed view
            // arrived; it must subsequently lose and free the label again.
            Ok(()) => {
                b.acks().relinquish(s2.id());
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(rejected, "remote declaration was never rejected");
}

#[tokio::test]
async fn non_participating_node_uses_null_arbiter() {
    let cluster = Cluster::new();
    let node = cluster
        .join(fast_config("node-plain").ack_role(AckRole::None))
        .await
        .unwrap();

    let (subscriber, _inbox) = node.subscriber(16);
    let err = node
        .acks()
        .declare(vec!["persisted".into()], &subscriber, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AckDeclarationUnsupported));

    // Removal and watch are no-ops, not errors.
    node.acks().relinquish(subscriber.id());
    let mut watch = node.acks().watch_declarations().await.unwrap();
    assert!(watch.recv().await.is_none());
}

#[tokio::test]
async fn blocklist_gates_entity_addressed_signals_cluster_wide() {
    let (_cluster, a, b) = two_nodes().await;

    a.blocked_namespaces().add("blocked.ns").await.unwrap();

    // Write-all: the other node's replica has the namespace before add
    // resolved.
    let blocked_signal = Signal::new("events:thing-modified")
        .entity_id(EntityId::new("blocked.ns", "thing1"))
        .header("origin", "test");
    match b.blocked_namespaces().block(blocked_signal).await {
        Err(Error::NamespaceBlocked { namespace, headers }) => {
            assert_eq!(namespace, "blocked.ns");
            assert_eq!(headers.get("origin").map(String::as_str), Some("test"));
        }
        other => panic!("expected blocked rejection, got {other:?}"),
    }

    let ok_signal =
        Signal::new("events:thing-modified").entity_id(EntityId::new("other.ns", "thing1"));
    assert!(b.blocked_namespaces().block(ok_signal).await.is_ok());

    // Unblocking reopens the namespace on every node.
    a.blocked_namespaces().remove("blocked.ns").await.unwrap();
    let reopened =
        Signal::new("events:thing-modified").entity_id(EntityId::new("blocked.ns", "thing1"));
    assert!(b.blocked_namespaces().block(reopened).await.is_ok());
}

#[tokio::test]
async fn resubscription_does_not_duplicate_deliveries() {
    let cluster = Cluster::new();
    let a = cluster.join(fast_config("node-a")).await.unwrap();

    let (subscriber, mut inbox) = a.subscriber(64);
    a.subscriptions()
        .subscribe(vec!["room.events".into()], &subscriber, SubscribeOptions::new())
        .await
        .unwrap();
    a.subscriptions()
        .subscribe(
            vec!["room.events".into()],
            &subscriber,
            SubscribeOptions::new().resubscribe(),
        )
        .await
        .unwrap();

    a.publisher().publish(event("room.events"), "k").await.unwrap();
    assert!(recv_published(&mut inbox, Duration::from_secs(2)).await.is_some());
    assert!(
        recv_published(&mut inbox, Duration::from_millis(300)).await.is_none(),
        "duplicate delivery after resubscription"
    );
}

#[tokio::test]
async fn subscribe_ack_honors_propagation_delay() {
    let cluster = Cluster::new();
    let node = cluster
        .join(fast_config("node-a").propagation_delay(Duration::from_millis(150)))
        .await
        .unwrap();

    let (subscriber, _inbox) = node.subscriber(16);
    let started = tokio::time::Instant::now();
    node.subscriptions()
        .subscribe(vec!["room.events".into()], &subscriber, SubscribeOptions::new())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn write_all_counts_only_current_members() {
    let cluster = Cluster::new();
    let a = cluster.join(fast_config("node-a")).await.unwrap();
    let b = cluster.join(fast_config("node-b")).await.unwrap();

    a.blocked_namespaces().add("ok.ns").await.unwrap();
    assert!(b.blocked_namespaces().contains("ok.ns").await);

    // After the peer leaves, a write-all no longer waits for it.
    b.leave();
    a.blocked_namespaces().add("later.ns").await.unwrap();
    assert!(a.blocked_namespaces().contains("later.ns").await);
}
