//! Discovery, presence, recall and typing routing through a full node.

use std::time::Duration;

use chrono::Utc;
use ipmsg_node::recall::RecallError;
use ipmsg_node::store::ContactStore;
use ipmsg_protocol::Command;

use crate::harness::{remote_packet, wait_until, TestNodeBuilder};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_node_announces_on_start() {
    let node = TestNodeBuilder::new("alice").group("eng").build().await.unwrap();

    assert!(node.mock.is_listening());
    let entry = node
        .mock
        .broadcast_packets()
        .into_iter()
        .find(|p| p.command == Command::EntryAnnounce)
        .expect("entry announce broadcast");
    assert_eq!(entry.sender_name, "alice");
    assert_eq!(entry.sender_host, "alice-host");
    assert!(entry.payload.starts_with("alice\0eng\0"));

    node.shutdown().await;
}

#[tokio::test]
async fn test_announced_peer_is_stored_and_online() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    let bob = node.announce_peer("bob", "10.0.0.2").await.unwrap();
    assert_eq!(bob.address, "10.0.0.2");
    assert_eq!(bob.hostname, "bob-host");

    let store = node.store.clone();
    wait_until(WAIT, "user stored", || {
        let store = store.clone();
        async move { store.user_count().unwrap() == 1 }
    })
    .await
    .unwrap();

    let presence = node.node.presence().clone();
    wait_until(WAIT, "bob online", || {
        let presence = presence.clone();
        async move { presence.is_online("bob").await.unwrap_or(false) }
    })
    .await
    .unwrap();

    // Re-announcing from a new address refreshes the peer but keeps its id
    let bob2 = node.announce_peer("bob", "10.0.0.9").await.unwrap();
    assert_eq!(bob2.id, bob.id);
    wait_until(WAIT, "address refresh", || {
        let discovery = node.node.discovery().clone();
        async move {
            discovery
                .peers()
                .await
                .map(|p| p.len() == 1 && p[0].address == "10.0.0.9")
                .unwrap_or(false)
        }
    })
    .await
    .unwrap();

    node.shutdown().await;
}

#[tokio::test]
async fn test_udp_message_lands_in_store() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    node.mock
        .simulate_packet(&remote_packet(Command::SendMessage, "bob", "hi alice"), "10.0.0.2");

    let store = node.store.clone();
    wait_until(WAIT, "message stored", || {
        let store = store.clone();
        async move {
            let (conv, _) = store
                .find_or_create_conversation("bob-host", "bob", "10.0.0.2", 2425, None)
                .unwrap();
            !store.messages(conv).unwrap().is_empty()
        }
    })
    .await
    .unwrap();

    let (conv, _) = node
        .store
        .find_or_create_conversation("bob-host", "bob", "10.0.0.2", 2425, None)
        .unwrap();
    let messages = node.store.messages(conv).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hi alice");

    // Every message is acknowledged
    assert!(node
        .mock
        .broadcast_packets()
        .iter()
        .any(|p| p.command == Command::MessageAck && p.payload.starts_with("1\0")));

    node.shutdown().await;
}

#[tokio::test]
async fn test_remote_recall_is_routed() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    node.mock
        .simulate_packet(&remote_packet(Command::RecallMessage, "bob", "msg-7"), "10.0.0.2");

    let n = &node.node;
    wait_until(WAIT, "recall recorded", || async move { n.is_recalled("msg-7").await })
        .await
        .unwrap();
    assert!(!node.node.is_recalled("msg-8").await);

    node.shutdown().await;
}

#[tokio::test]
async fn test_local_recall() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();

    assert!(matches!(
        node.node.recall_message("m1", "bob", Utc::now(), false).await,
        Err(RecallError::NotAuthorized)
    ));
    node.node
        .recall_message("m1", "alice", Utc::now(), false)
        .await
        .unwrap();
    assert!(node.node.is_recalled("m1").await);
    assert!(node
        .mock
        .broadcast_packets()
        .iter()
        .any(|p| p.command == Command::RecallMessage && p.payload.starts_with("m1\0")));
    assert!(matches!(
        node.node.recall_message("m1", "alice", Utc::now(), false).await,
        Err(RecallError::AlreadyRecalled)
    ));

    node.shutdown().await;
}

#[tokio::test]
async fn test_typing_routed_only_when_addressed_to_us() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    let typing = node.node.typing().clone();

    node.mock
        .simulate_packet(&remote_packet(Command::Typing, "carol", "dave"), "10.0.0.3");
    node.mock
        .simulate_packet(&remote_packet(Command::Typing, "bob", "alice"), "10.0.0.2");

    let t = typing.clone();
    wait_until(WAIT, "bob typing", || {
        let t = t.clone();
        async move { t.is_typing("bob").await.unwrap_or(false) }
    })
    .await
    .unwrap();
    // carol's packet was addressed to someone else
    assert!(!typing.is_typing("carol").await.unwrap());

    node.mock
        .simulate_packet(&remote_packet(Command::StopTyping, "bob", "alice"), "10.0.0.2");
    let t = typing.clone();
    wait_until(WAIT, "bob stopped", || {
        let t = t.clone();
        async move { !t.is_typing("bob").await.unwrap_or(true) }
    })
    .await
    .unwrap();

    node.shutdown().await;
}

#[tokio::test]
async fn test_typing_expires_without_stop() {
    let node = TestNodeBuilder::new("alice")
        .typing_timeout_ms(100, 20)
        .build()
        .await
        .unwrap();
    let typing = node.node.typing().clone();

    node.mock
        .simulate_packet(&remote_packet(Command::Typing, "bob", "alice"), "10.0.0.2");
    let t = typing.clone();
    wait_until(WAIT, "bob typing", || {
        let t = t.clone();
        async move { t.is_typing("bob").await.unwrap_or(false) }
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!typing.is_typing("bob").await.unwrap());
    assert!(typing.typing_peers().await.unwrap().is_empty());

    node.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_announces_exit() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    let mock = node.mock.clone();
    node.shutdown().await;

    assert!(mock
        .broadcast_packets()
        .iter()
        .any(|p| p.command == Command::ExitAnnounce && p.sender_name == "alice"));
}
