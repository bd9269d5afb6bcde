//! TCP delivery into a running node.

use std::time::Duration;

use ipmsg_node::delivery::DeliveryError;
use ipmsg_node::store::ContactStore;

use crate::harness::{wait_until, TestNode, TestNodeBuilder};

#[tokio::test]
async fn test_tcp_message_reaches_store() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    let port = node.node.tcp_addr().port();

    let mut delivery = node.delivery_from("bob");
    let seq = delivery
        .send_message("hello over tcp", "127.0.0.1", port)
        .await
        .unwrap();
    assert_eq!(seq, 1);

    let store = node.store.clone();
    wait_until(Duration::from_secs(2), "tcp message stored", || {
        let store = store.clone();
        async move {
            let (conv, _) = store
                .find_or_create_conversation("bob-host", "bob", "127.0.0.1", 2425, None)
                .unwrap();
            !store.messages(conv).unwrap().is_empty()
        }
    })
    .await
    .unwrap();

    let (conv, _) = node
        .store
        .find_or_create_conversation("bob-host", "bob", "127.0.0.1", 2425, None)
        .unwrap();
    let messages = node.store.messages(conv).unwrap();
    assert_eq!(messages[0].content, "hello over tcp");
    assert_eq!(messages[0].sequence_no, 1);

    delivery.disconnect_all();
    node.shutdown().await;
}

/// Contents of bob's conversation with the node, in arrival order.
fn stored_from_bob(node: &TestNode) -> Vec<String> {
    let (conv, _) = node
        .store
        .find_or_create_conversation("bob-host", "bob", "127.0.0.1", 2425, None)
        .unwrap();
    node.store
        .messages(conv)
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect()
}

#[tokio::test]
async fn test_pooled_connection_carries_every_message() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    let port = node.node.tcp_addr().port();
    let mut delivery = node.delivery_from("bob");

    let first = delivery.send_message("one", "127.0.0.1", port).await.unwrap();
    let second = delivery.send_message("two", "127.0.0.1", port).await.unwrap();
    let third = delivery.send_message("three", "127.0.0.1", port).await.unwrap();
    assert_eq!((first, second, third), (1, 2, 3));
    assert_eq!(delivery.active_connections(), 1);

    let n = &node;
    wait_until(Duration::from_secs(2), "three messages stored", || async move {
        stored_from_bob(n).len() == 3
    })
    .await
    .unwrap();
    assert_eq!(stored_from_bob(&node), vec!["one", "two", "three"]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_large_message_arrives_intact() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    let port = node.node.tcp_addr().port();
    let mut delivery = node.delivery_from("bob");

    let body: String = (0..10_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    delivery.send_message(&body, "127.0.0.1", port).await.unwrap();
    delivery.send_message("after", "127.0.0.1", port).await.unwrap();

    let n = &node;
    wait_until(Duration::from_secs(2), "both messages stored", || async move {
        stored_from_bob(n).len() == 2
    })
    .await
    .unwrap();
    let stored = stored_from_bob(&node);
    assert_eq!(stored[0], body);
    assert_eq!(stored[1], "after");

    node.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_host_exhausts_retries() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();

    // Reserve a port and release it so nothing listens there
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut delivery = node.delivery_from("bob");
    let err = delivery
        .send_message("nobody home", "127.0.0.1", port)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DeliveryError::MaxRetriesExceeded {
            host: "127.0.0.1".into(),
            port,
        }
    );
    assert_eq!(delivery.active_connections(), 0);

    node.shutdown().await;
}
