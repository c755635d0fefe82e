//! Per-socket handshake state machine.
//!
//! Sans-IO: the client task feeds received bytes in and carries out the
//! returned actions. Nothing in here touches a socket.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bitmessage_governor::PeerId;
use bitmessage_protocol::varint::{to_ipv4, NetAddr};
use bitmessage_protocol::{create, parse, Command, Message, VersionMessage};
use bytes::{Bytes, BytesMut};

/// Client-assigned identity of one open socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// What this process advertises about itself in `version`.
#[derive(Debug, Clone)]
pub struct LocalNode {
    /// Random per process. A `version` carrying it back means we dialed
    /// ourselves.
    pub nonce: u64,
    pub listen_port: u16,
    pub services: u64,
    pub protocol_version: u32,
    pub stream: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    StreamMismatch,
    SelfConnection,
    HandshakeTimeout,
    Inactive,
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CloseReason::StreamMismatch => "not interested in our stream",
            CloseReason::SelfConnection => "connected to ourself",
            CloseReason::HandshakeTimeout => "handshake timed out",
            CloseReason::Inactive => "inactive",
            CloseReason::Shutdown => "shutting down",
        })
    }
}

/// Side effects requested by the state machine, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(Bytes),
    Close(CloseReason),
    Handshaked,
}

/// Point-in-time view of a connection, for `ClientHandle::snapshot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub direction: Direction,
    pub remote_addr: SocketAddr,
    pub peer: Option<PeerId>,
    pub protocol_version: Option<u32>,
    pub remote_listening_port: Option<u16>,
    pub remote_user_agent: Option<String>,
    pub sent_verack: bool,
    pub received_verack: bool,
    pub handshaked: bool,
}

type Handler = fn(&mut Connection, &LocalNode, Message, &mut Vec<Action>);

/// Dispatch table. Commands without a payload codec map to a no-op.
fn handler_for(command: Command) -> Handler {
    match command {
        Command::Version => Connection::received_version,
        Command::Verack => Connection::received_verack,
        Command::Addr
        | Command::Inv
        | Command::GetData
        | Command::Msg
        | Command::Broadcast
        | Command::Ping
        | Command::Pong
        | Command::Alert => Connection::received_unimplemented,
    }
}

#[derive(Debug)]
pub struct Connection {
    direction: Direction,
    peer: Option<PeerId>,
    remote: SocketAddr,
    remote_services: u64,
    protocol_version: Option<u32>,
    remote_listening_port: Option<u16>,
    remote_user_agent: Option<String>,
    sent_version: bool,
    sent_verack: bool,
    received_verack: bool,
    handshaked: bool,
    closing: bool,
    buffer: BytesMut,
    established_at: Instant,
    last_activity: Instant,
}

impl Connection {
    /// A connection we dialed to a registry peer.
    pub fn outbound(peer: PeerId, remote: SocketAddr, services: u64, now: Instant) -> Self {
        Self::new(Direction::Outbound, Some(peer), remote, services, now)
    }

    /// A connection accepted on the listener. Not tied to any registry peer.
    pub fn inbound(remote: SocketAddr, now: Instant) -> Self {
        Self::new(Direction::Inbound, None, remote, 0, now)
    }

    fn new(
        direction: Direction,
        peer: Option<PeerId>,
        remote: SocketAddr,
        remote_services: u64,
        now: Instant,
    ) -> Self {
        Self {
            direction,
            peer,
            remote,
            remote_services,
            protocol_version: None,
            remote_listening_port: None,
            remote_user_agent: None,
            sent_version: false,
            sent_verack: false,
            received_verack: false,
            handshaked: false,
            closing: false,
            buffer: BytesMut::new(),
            established_at: now,
            last_activity: now,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_handshaked(&self) -> bool {
        self.handshaked
    }

    /// `min(local, remote)` once the remote's `version` was accepted.
    pub fn protocol_version(&self) -> Option<u32> {
        self.protocol_version
    }

    pub fn remote_listening_port(&self) -> Option<u16> {
        self.remote_listening_port
    }

    pub fn info(&self, id: ConnectionId) -> ConnectionInfo {
        ConnectionInfo {
            id,
            direction: self.direction,
            remote_addr: self.remote,
            peer: self.peer,
            protocol_version: self.protocol_version,
            remote_listening_port: self.remote_listening_port,
            remote_user_agent: self.remote_user_agent.clone(),
            sent_verack: self.sent_verack,
            received_verack: self.received_verack,
            handshaked: self.handshaked,
        }
    }

    /// Socket is up. Outbound connections open with `version`; inbound ones
    /// wait for the remote to speak first.
    pub fn on_established(&mut self, local: &LocalNode) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.direction == Direction::Outbound {
            self.send_version(local, &mut actions);
        }
        actions
    }

    /// Append received bytes and dispatch every complete frame in order.
    pub fn receive_data(&mut self, local: &LocalNode, data: &[u8], now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.closing {
            return actions;
        }
        self.last_activity = now;

        self.buffer.extend_from_slice(data);
        let (rest, messages) = parse(std::mem::take(&mut self.buffer));
        self.buffer = rest;

        for message in messages {
            if self.closing {
                break;
            }
            self.dispatch(local, message, &mut actions);
        }
        actions
    }

    /// Outgoing traffic also counts as activity.
    pub fn record_sent(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Checked by housekeeping. Before the handshake the clock runs from
    /// establishment; after it, from the last traffic in either direction.
    pub fn check_timeouts(
        &self,
        now: Instant,
        handshake_timeout: Duration,
        inactivity_timeout: Duration,
    ) -> Option<CloseReason> {
        if !self.handshaked {
            (now.saturating_duration_since(self.established_at) > handshake_timeout)
                .then_some(CloseReason::HandshakeTimeout)
        } else {
            (now.saturating_duration_since(self.last_activity) > inactivity_timeout)
                .then_some(CloseReason::Inactive)
        }
    }

    fn dispatch(&mut self, local: &LocalNode, message: Message, actions: &mut Vec<Action>) {
        let command = message.command();
        if command.requires_handshake() && !self.handshaked {
            tracing::debug!(
                remote = %self.remote,
                %command,
                "dropping command received before handshake"
            );
            return;
        }
        tracing::debug!(remote = %self.remote, %command, "received");
        handler_for(command)(self, local, message, actions);
    }

    fn received_version(&mut self, local: &LocalNode, message: Message, actions: &mut Vec<Action>) {
        let Message::Version(version) = message else {
            return;
        };
        if self.sent_verack {
            tracing::debug!(remote = %self.remote, "ignoring duplicate version");
            return;
        }
        tracing::debug!(
            remote = %self.remote,
            user_agent = %version.user_agent,
            streams = ?version.streams,
            "remote version"
        );

        if !version.is_interested_in(local.stream) {
            self.close(CloseReason::StreamMismatch, actions);
            return;
        }
        if version.nonce == local.nonce {
            self.close(CloseReason::SelfConnection, actions);
            return;
        }

        self.protocol_version = Some(local.protocol_version.min(version.protocol_version));
        self.remote_listening_port = Some(version.src.port);
        self.remote_services = version.services;
        self.remote_user_agent = Some(version.user_agent);

        if !self.sent_version {
            self.send_version(local, actions);
        }
        self.sent_verack = true;
        actions.push(Action::Send(create(&Message::Verack)));
        self.check_handshake_completion(actions);
    }

    fn received_verack(
        &mut self,
        _local: &LocalNode,
        _message: Message,
        actions: &mut Vec<Action>,
    ) {
        self.received_verack = true;
        self.check_handshake_completion(actions);
    }

    fn received_unimplemented(
        &mut self,
        _local: &LocalNode,
        message: Message,
        _actions: &mut Vec<Action>,
    ) {
        tracing::debug!(
            remote = %self.remote,
            command = %message.command(),
            "no handler for command"
        );
    }

    fn send_version(&mut self, local: &LocalNode, actions: &mut Vec<Action>) {
        let dest_ip = to_ipv4(self.remote.ip()).unwrap_or(Ipv4Addr::UNSPECIFIED);
        let dest = NetAddr::new(dest_ip, self.remote.port(), self.remote_services);
        // The remote ignores our source IP; only the port matters.
        let src = NetAddr::new(Ipv4Addr::UNSPECIFIED, local.listen_port, local.services);
        let version = VersionMessage {
            protocol_version: local.protocol_version,
            user_agent: local.user_agent.clone(),
            streams: vec![local.stream],
            ..VersionMessage::new(dest, src, local.nonce)
        };
        self.sent_version = true;
        actions.push(Action::Send(create(&Message::Version(version))));
    }

    fn check_handshake_completion(&mut self, actions: &mut Vec<Action>) {
        if self.sent_verack && self.received_verack && !self.handshaked {
            self.handshaked = true;
            tracing::info!(
                remote = %self.remote,
                direction = ?self.direction,
                protocol_version = self.protocol_version,
                "handshake completed"
            );
            actions.push(Action::Handshaked);
        }
    }

    fn close(&mut self, reason: CloseReason, actions: &mut Vec<Action>) {
        tracing::warn!(remote = %self.remote, %reason, "closing connection");
        self.closing = true;
        actions.push(Action::Close(reason));
    }
}
