//! End-to-end scenarios (spec §8 "Concrete end-to-end scenarios"), driven
//! against [`FakeBroker`] the way the teacher's `server2` integration tests
//! drive a loopback transport.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use wormhole::channel::fake::FakeBroker;
use wormhole::{Channel, Message, Node, NodeConfig, Waitable};

fn shared_broker() -> Arc<dyn Channel> {
    Arc::new(FakeBroker::new())
}

fn test_config() -> NodeConfig {
    NodeConfig::new("redis://unused/").with_reply_expiration_s(5)
}

#[derive(Serialize, Deserialize)]
struct SumMessage {
    numbers: Vec<i64>,
}

impl Message for SumMessage {}

#[tokio::test]
async fn typed_message_dispatch() {
    let broker = shared_broker();
    let node = Node::new(broker.clone(), test_config());
    node.register_handler(SumMessage::queue_base(), None, |msg: SumMessage| async move {
        Ok::<i64, String>(msg.numbers.iter().sum())
    })
    .await
    .unwrap();

    let handle = tokio::spawn(node.clone().process_blocking());

    let session = node
        .send(
            SumMessage::queue_base(),
            &SumMessage { numbers: vec![1, 2, 3] },
            None,
            None,
            None,
        )
        .await
        .unwrap();
    let result: Option<i64> = session.wait(true, 0).await.unwrap();
    assert_eq!(result, Some(6));

    node.stop(true).await;
    handle.await.unwrap();
}

#[tokio::test]
async fn large_payload_round_trips_gzipped() {
    let broker = shared_broker();
    let node = Node::new(broker.clone(), test_config());
    node.register_handler("reverse", None, |s: String| async move {
        Ok::<String, String>(s.chars().rev().collect())
    })
    .await
    .unwrap();

    let handle = tokio::spawn(node.clone().process_blocking());

    // 762 KiB, comfortably past the 2048-byte compression threshold.
    let input: String = "wormhole-payload-".repeat(762 * 1024 / 17 + 1);
    let input: String = input.chars().take(762 * 1024).collect();
    let expected: String = input.chars().rev().collect();

    let encoded_request = wormhole::encoding::encode(&input);
    assert!(wormhole::encoding::is_gzipped(&encoded_request));

    let session = node.send("reverse", &input, None, None, None).await.unwrap();
    let result: Option<String> = session.wait(true, 0).await.unwrap();
    assert_eq!(result, Some(expected));

    node.stop(true).await;
    handle.await.unwrap();
}

#[tokio::test]
async fn group_fan_out_across_five_nodes() {
    let broker = shared_broker();
    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let node = Node::new(broker.clone(), test_config());
        node.add_to_group("G").await;
        node.register_handler("work", None, |x: i64| async move { Ok::<i64, String>(x) })
            .await
            .unwrap();
        handles.push(tokio::spawn(node.clone().process_blocking()));
        nodes.push(node);
    }

    // let the group-membership loop tick run at least once on every node.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let sender = Node::new(broker.clone(), test_config());
    let mut claimers = std::collections::HashSet::new();
    for i in 0..400i64 {
        let session = sender
            .send("work", &i, None, Some("G".to_string()), None)
            .await
            .unwrap();
        let _: Option<i64> = session.wait(true, 0).await.unwrap();
        claimers.insert(session.claimer().await);
    }

    let node_ids: std::collections::HashSet<_> = nodes.iter().map(|n| n.id).collect();
    assert_eq!(claimers, node_ids, "every claimer must be one of the five group members");

    for node in &nodes {
        node.stop(true).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn session_stickiness_routes_to_same_claimer() {
    let broker = shared_broker();
    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let node = Node::new(broker.clone(), test_config());
        node.add_to_group("G").await;
        node.register_handler("sticky", None, |x: i64| async move { Ok::<i64, String>(x) })
            .await
            .unwrap();
        handles.push(tokio::spawn(node.clone().process_blocking()));
        nodes.push(node);
    }
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let sender = Node::new(broker.clone(), test_config());
    let first = sender
        .send("sticky", &1i64, None, Some("G".to_string()), None)
        .await
        .unwrap();
    let _: Option<i64> = first.wait(true, 0).await.unwrap();
    let claimer = first.claimer().await;

    for _ in 0..20 {
        let session = sender
            .send("sticky", &1i64, None, None, Some(claimer))
            .await
            .unwrap();
        let _: Option<i64> = session.wait(true, 0).await.unwrap();
        assert_eq!(session.claimer().await, claimer);
    }

    for node in &nodes {
        node.stop(true).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn wait_for_any_prefers_whichever_is_popped_first() {
    let broker = shared_broker();
    let sender_id = wormhole::NodeId::new();
    let receiver_id = wormhole::NodeId::new();

    let tagged_uri = wormhole::QueueUri::new("asd").with_tag("t1");
    let plain_uri = wormhole::QueueUri::new("asd");

    broker
        .enqueue(sender_id, &plain_uri, wormhole::encoding::encode(&1i64), 5, 0)
        .await
        .unwrap();
    broker
        .enqueue(sender_id, &tagged_uri, wormhole::encoding::encode(&2i64), 5, 0)
        .await
        .unwrap();

    let items = vec![Waitable::tagged("asd", "t1"), Waitable::queue("asd")];
    let first = wormhole::wait_for_any(broker.clone(), receiver_id, &items, 1, 5)
        .await
        .unwrap()
        .unwrap();
    first.reply(wormhole::encoding::encode(&"ok"), false).await.unwrap();

    let second = wormhole::wait_for_any(broker.clone(), receiver_id, &items, 1, 5)
        .await
        .unwrap()
        .unwrap();
    second.reply(wormhole::encoding::encode(&"ok"), false).await.unwrap();

    let tags: std::collections::HashSet<Option<String>> = [
        first.tag().map(String::from),
        second.tag().map(String::from),
    ]
    .into_iter()
    .collect();
    assert!(tags.contains(&Some("t1".to_string())));
    assert!(tags.contains(&None));
}

#[tokio::test]
async fn ping_self_under_no_load_is_fast() {
    let broker = shared_broker();
    let node = Node::new(broker.clone(), test_config());
    let handle = tokio::spawn(node.clone().process_blocking());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let rtt = node.ping(node.id).await.unwrap();
    assert!(rtt < 0.05, "ping took {rtt}s, expected < 50ms under no load");

    node.stop(true).await;
    handle.await.unwrap();
}
