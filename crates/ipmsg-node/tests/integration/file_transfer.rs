//! File offers announced over UDP, served over loopback TCP.

use std::time::Duration;

use ipmsg_node::file_transfer::{FileClient, TransferError};
use ipmsg_protocol::{Command, FileOffer, GetFileData, Packet};

use crate::harness::{TestNode, TestNodeBuilder};

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

/// The SEND_MESSAGE unicast carrying the offer, with our instance id removed.
fn sent_offer(node: &TestNode) -> (Packet, FileOffer) {
    let packet = node
        .mock
        .sent_packets()
        .into_iter()
        .find(|p| p.command == Command::SendMessage)
        .expect("offer unicast");
    let payload = packet
        .payload
        .rsplit_once('\0')
        .map(|(content, _)| content)
        .unwrap_or(&packet.payload);
    let offer = FileOffer::parse(payload).expect("attachment flag set");
    (packet, offer)
}

#[tokio::test]
async fn test_offer_then_fetch_over_tcp() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    let bob = node.announce_peer("bob", "127.0.0.1").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.bin");
    let data = test_data(200_000);
    std::fs::write(&path, &data).unwrap();

    let seq = node
        .node
        .offer_files(&bob, "see attached", &[path])
        .await
        .unwrap();

    let (packet, offer) = sent_offer(&node);
    assert_eq!(packet.sequence_no, seq);
    assert_eq!(offer.text, "see attached");
    assert_eq!(offer.files.len(), 1);
    assert_eq!(offer.files[0].file_name, "report.bin");
    assert_eq!(offer.files[0].file_size, data.len() as i64);

    let sent = node.mock.sent();
    assert!(sent.iter().any(|s| s.host == "127.0.0.1"));

    let client = FileClient::new("bob", "bob-host", Duration::from_secs(5), 65536);
    let port = node.node.tcp_addr().port();
    let rx = client
        .fetch(
            "127.0.0.1",
            port,
            GetFileData {
                sequence_no: seq,
                file_id: offer.files[0].file_id,
                offset: 0,
            },
            offer.files[0].file_size,
        )
        .await
        .unwrap();
    assert!(rx.is_complete());
    assert_eq!(rx.progress(), 1.0);
    assert_eq!(rx.assemble_data(), data);

    node.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_fetch_resumes_from_offset() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    let bob = node.announce_peer("bob", "127.0.0.1").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movie.bin");
    let data = test_data(150_000);
    std::fs::write(&path, &data).unwrap();
    let seq = node.node.offer_files(&bob, "", &[path]).await.unwrap();

    // Pretend the first 100k arrived in an earlier attempt
    let held = 100_000i64;
    let client = FileClient::new("bob", "bob-host", Duration::from_secs(5), 65536);
    let rx = client
        .fetch(
            "127.0.0.1",
            node.node.tcp_addr().port(),
            GetFileData {
                sequence_no: seq,
                file_id: 0,
                offset: held,
            },
            data.len() as i64,
        )
        .await
        .unwrap();
    assert!(rx.is_complete());
    assert_eq!(rx.received_bytes(), data.len() as i64);
    assert_eq!(rx.assemble_data(), &data[held as usize..]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_released_offer_is_no_longer_served() {
    let node = TestNodeBuilder::new("alice").build().await.unwrap();
    let bob = node.announce_peer("bob", "127.0.0.1").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("note.txt");
    std::fs::write(&path, b"short note").unwrap();
    let seq = node.node.offer_files(&bob, "", &[path]).await.unwrap();

    let port = node.node.tcp_addr().port();
    let client = FileClient::new("bob", "bob-host", Duration::from_secs(5), 65536);
    client.release("127.0.0.1", port, seq).await.unwrap();
    // Release is handled asynchronously by the server task
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client
        .fetch(
            "127.0.0.1",
            port,
            GetFileData {
                sequence_no: seq,
                file_id: 0,
                offset: 0,
            },
            10,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Incomplete { received: 0, expected: 10 }));

    node.shutdown().await;
}
