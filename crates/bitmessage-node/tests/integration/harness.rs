//! Test harness for in-process bitmessage-node integration tests.
//!
//! Provides TestClient (a running client on loopback) and RawPeer (a bare
//! socket speaking the wire protocol by hand).

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bitmessage_governor::{Governor, GovernorTargets};
use bitmessage_node::{Client, ClientError, ClientHandle, ClientSettings, ConnectionInfo};
use bitmessage_protocol::varint::NetAddr;
use bitmessage_protocol::{create, parse, Message, VersionMessage};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// A running client bound to an ephemeral loopback port.
pub struct TestClient {
    pub handle: ClientHandle,
    task: JoinHandle<Result<(), ClientError>>,
}

#[allow(dead_code)]
impl TestClient {
    /// Start a client whose registry holds `peers`.
    pub async fn spawn(peers: &[SocketAddr]) -> anyhow::Result<Self> {
        let settings = ClientSettings {
            listen_addr: "127.0.0.1:0".parse()?,
            ..Default::default()
        };
        let mut governor = Governor::new(GovernorTargets::default());
        for peer in peers {
            governor.add_peer(peer.ip().to_string(), peer.port(), 1);
        }
        let (client, handle) = Client::bind(settings, governor).await?;
        let task = tokio::spawn(client.run());
        Ok(Self { handle, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Poll snapshots until `pred` holds, or fail after `timeout`.
    pub async fn wait_for<F>(
        &self,
        timeout: Duration,
        pred: F,
    ) -> anyhow::Result<Vec<ConnectionInfo>>
    where
        F: Fn(&[ConnectionInfo]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.handle.snapshot().await?;
            if pred(&snapshot) {
                return Ok(snapshot);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for condition. snapshot: {snapshot:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn wait_handshaked(
        &self,
        n: usize,
        timeout: Duration,
    ) -> anyhow::Result<Vec<ConnectionInfo>> {
        self.wait_for(timeout, |s| s.iter().filter(|c| c.handshaked).count() >= n)
            .await
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.handle.shutdown().await?;
        self.task.await??;
        Ok(())
    }
}

/// A hand-driven peer on a raw TCP socket.
pub struct RawPeer {
    stream: TcpStream,
    buf: BytesMut,
    pending: VecDeque<Message>,
}

#[allow(dead_code)]
impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
            buf: BytesMut::new(),
            pending: VecDeque::new(),
        })
    }

    pub fn version(nonce: u64, listen_port: u16, streams: Vec<u64>) -> Message {
        let dest = NetAddr::new(Ipv4Addr::LOCALHOST, 8444, 1);
        let src = NetAddr::new(Ipv4Addr::UNSPECIFIED, listen_port, 1);
        Message::Version(VersionMessage {
            streams,
            ..VersionMessage::new(dest, src, nonce)
        })
    }

    pub async fn send(&mut self, message: &Message) -> anyhow::Result<()> {
        self.stream.write_all(&create(message)).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Next decoded message, or an error on timeout or EOF.
    pub async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Message> {
        tokio::time::timeout(timeout, self.recv_inner()).await?
    }

    async fn recv_inner(&mut self) -> anyhow::Result<Message> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(message);
            }
            let (rest, messages) = parse(std::mem::take(&mut self.buf));
            self.buf = rest;
            if !messages.is_empty() {
                self.pending.extend(messages);
                continue;
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                anyhow::bail!("connection closed by remote");
            }
        }
    }

    /// True once the remote closed the socket.
    pub async fn closed_within(&mut self, timeout: Duration) -> bool {
        let mut scratch = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(left, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}
