//! Handshake scenarios between in-process clients and raw peers.

use std::time::Duration;

use bitmessage_node::Direction;
use bitmessage_protocol::Message;

use crate::harness::{RawPeer, TestClient};

const WAIT: Duration = Duration::from_secs(5);

/// A dials B; both sides reach handshaked.
#[tokio::test]
async fn test_two_clients_handshake() {
    let b = TestClient::spawn(&[]).await.unwrap();
    let a = TestClient::spawn(&[b.addr()]).await.unwrap();

    let a_conns = a.wait_handshaked(1, WAIT).await.unwrap();
    let b_conns = b.wait_handshaked(1, WAIT).await.unwrap();

    assert_eq!(a_conns.len(), 1);
    assert_eq!(a_conns[0].direction, Direction::Outbound);
    assert_eq!(a_conns[0].protocol_version, Some(2));
    assert_eq!(a_conns[0].remote_listening_port, Some(b.addr().port()));

    assert_eq!(b_conns.len(), 1);
    assert_eq!(b_conns[0].direction, Direction::Inbound);
    assert_eq!(b_conns[0].remote_listening_port, Some(a.addr().port()));
    assert!(b_conns[0].sent_verack && b_conns[0].received_verack);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

/// A client that finds its own address in the registry never handshakes
/// with itself.
#[tokio::test]
async fn test_self_connection_is_rejected() {
    let a = TestClient::spawn(&[]).await.unwrap();
    a.handle
        .add_peer(a.addr().ip().to_string(), a.addr().port(), 1)
        .await
        .unwrap();

    // The dial goes out on the next tick and both ends close right away.
    // Had the handshake succeeded, two handshaked connections would remain.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let snapshot = a.handle.snapshot().await.unwrap();
    assert!(snapshot.is_empty(), "{snapshot:?}");

    a.shutdown().await.unwrap();
}

/// Inbound side answers a version with its own version, then verack.
#[tokio::test]
async fn test_raw_peer_handshake() {
    let a = TestClient::spawn(&[]).await.unwrap();
    let mut peer = RawPeer::connect(a.addr()).await.unwrap();

    peer.send(&RawPeer::version(0xfeed, 9999, vec![1])).await.unwrap();
    match peer.recv(WAIT).await.unwrap() {
        Message::Version(v) => {
            assert_eq!(v.nonce, a.handle.nonce());
            assert_eq!(v.src.port, a.addr().port());
            assert!(v.streams.contains(&1));
        }
        other => panic!("expected version, got {other:?}"),
    }
    assert_eq!(peer.recv(WAIT).await.unwrap(), Message::Verack);

    peer.send(&Message::Verack).await.unwrap();
    let conns = a.wait_handshaked(1, WAIT).await.unwrap();
    assert_eq!(conns[0].remote_listening_port, Some(9999));

    a.shutdown().await.unwrap();
}

/// A peer not interested in our stream is dropped.
#[tokio::test]
async fn test_stream_mismatch_closes() {
    let a = TestClient::spawn(&[]).await.unwrap();
    let mut peer = RawPeer::connect(a.addr()).await.unwrap();

    peer.send(&RawPeer::version(0xfeed, 9999, vec![7])).await.unwrap();
    assert!(peer.closed_within(WAIT).await);
    a.wait_for(WAIT, |s| s.is_empty()).await.unwrap();

    a.shutdown().await.unwrap();
}

/// Garbage ahead of a valid frame is skipped without closing the socket.
#[tokio::test]
async fn test_garbage_before_version() {
    let a = TestClient::spawn(&[]).await.unwrap();
    let mut peer = RawPeer::connect(a.addr()).await.unwrap();

    peer.send_raw(b"\x00\x01garbage\xe9\xbe").await.unwrap();
    peer.send(&RawPeer::version(0xfeed, 9999, vec![1])).await.unwrap();
    assert!(matches!(peer.recv(WAIT).await.unwrap(), Message::Version(_)));
    assert_eq!(peer.recv(WAIT).await.unwrap(), Message::Verack);

    a.shutdown().await.unwrap();
}
