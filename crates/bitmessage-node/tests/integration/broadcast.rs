//! Broadcast reaches handshaked connections only.

use std::time::Duration;

use bitmessage_protocol::{create, Message, Unimplemented};

use crate::harness::{RawPeer, TestClient};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_broadcast_skips_unhandshaked() {
    let a = TestClient::spawn(&[]).await.unwrap();
    let mut ready = RawPeer::connect(a.addr()).await.unwrap();
    let mut idle = RawPeer::connect(a.addr()).await.unwrap();

    ready.send(&RawPeer::version(0xbeef, 9000, vec![1])).await.unwrap();
    ready.recv(WAIT).await.unwrap();
    ready.recv(WAIT).await.unwrap();
    ready.send(&Message::Verack).await.unwrap();

    a.wait_for(WAIT, |s| s.len() == 2 && s.iter().filter(|c| c.handshaked).count() == 1)
        .await
        .unwrap();

    let frame = create(&Message::Ping(Unimplemented));
    assert_eq!(a.handle.broadcast(frame).await.unwrap(), 1);
    assert_eq!(
        ready.recv(WAIT).await.unwrap(),
        Message::Ping(Unimplemented)
    );
    assert!(idle.recv(Duration::from_millis(300)).await.is_err());

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_between_clients() {
    let b = TestClient::spawn(&[]).await.unwrap();
    let a = TestClient::spawn(&[b.addr()]).await.unwrap();
    a.wait_handshaked(1, WAIT).await.unwrap();
    b.wait_handshaked(1, WAIT).await.unwrap();

    let frame = create(&Message::Pong(Unimplemented));
    assert_eq!(b.handle.broadcast(frame).await.unwrap(), 1);

    // Post-handshake traffic without a handler leaves the connection up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let conns = a.handle.snapshot().await.unwrap();
    assert_eq!(conns.len(), 1);
    assert!(conns[0].handshaked);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
