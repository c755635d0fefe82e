//! Client task -- owns the governor and every open connection.
//!
//! One task mutates all client state. Socket I/O runs in helper tasks
//! that only exchange events and frames with it over channels:
//!   - accept task: new inbound sockets
//!   - dial tasks: outbound connect results
//!   - per connection: a reader forwarding raw bytes, a writer draining a
//!     bounded frame queue
//!
//! The housekeeping tick expires stale connections and asks the governor
//! which peers to dial.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bitmessage_governor::{Governor, GovernorTargets, PeerId};
use bitmessage_protocol::ProtocolError;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connection::{
    Action, CloseReason, Connection, ConnectionId, ConnectionInfo, Direction, LocalNode,
};

const READ_CHUNK: usize = 64 * 1024;
const EVENT_QUEUE: usize = 1024;
const COMMAND_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("client task is no longer running")]
    ChannelClosed,
}

/// Runtime settings. Built from `NodeConfig::client_settings()`.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub listen_addr: SocketAddr,
    pub targets: GovernorTargets,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub protocol_version: u32,
    pub services: u64,
    pub stream: u64,
    pub user_agent: String,
    /// Frames queued per connection before sends to it are dropped.
    pub write_queue: usize,
    /// A single frame write, or the final shutdown, stalling longer than
    /// this drops the socket.
    pub write_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], bitmessage_protocol::DEFAULT_PORT)),
            targets: GovernorTargets::default(),
            dial_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(20),
            inactivity_timeout: Duration::from_secs(
                bitmessage_protocol::MAINNET.inactivity_timeout_secs,
            ),
            protocol_version: bitmessage_protocol::PROTOCOL_VERSION,
            services: bitmessage_protocol::SERVICES_PROVIDED,
            stream: bitmessage_protocol::STREAM,
            user_agent: bitmessage_protocol::user_agent(),
            write_queue: 256,
            write_timeout: Duration::from_secs(20),
        }
    }
}

/// Commands accepted by the client task.
#[derive(Debug)]
pub enum ClientCommand {
    /// Queue a complete frame to every handshaked connection.
    Broadcast(Bytes, oneshot::Sender<usize>),
    AddPeer {
        host: String,
        port: u16,
        services: u64,
        reply: oneshot::Sender<PeerId>,
    },
    Snapshot(oneshot::Sender<Vec<ConnectionInfo>>),
    Shutdown,
}

/// Cloneable handle for talking to a running client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ClientCommand>,
    local_addr: SocketAddr,
    nonce: u64,
}

impl ClientHandle {
    /// Address the listener actually bound (port resolved if 0 was asked).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Send a raw frame to every handshaked peer. Returns how many
    /// connections accepted it into their queue.
    pub async fn broadcast(&self, frame: Bytes) -> Result<usize, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::Broadcast(frame, reply)).await?;
        rx.await.map_err(|_| ClientError::ChannelClosed)
    }

    pub async fn add_peer(
        &self,
        host: impl Into<String>,
        port: u16,
        services: u64,
    ) -> Result<PeerId, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::AddPeer {
            host: host.into(),
            port,
            services,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::ChannelClosed)
    }

    /// Current connections, in id order.
    pub async fn snapshot(&self) -> Result<Vec<ConnectionInfo>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| ClientError::ChannelClosed)
    }

    /// Close every connection, release the listener and stop the task.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.send(ClientCommand::Shutdown).await
    }

    async fn send(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ClientError::ChannelClosed)
    }
}

enum Event {
    Accepted(TcpStream, SocketAddr),
    Dialed {
        peer: PeerId,
        result: io::Result<TcpStream>,
    },
    Data(ConnectionId, Bytes),
    Closed(ConnectionId),
}

struct ConnEntry {
    conn: Connection,
    writer: mpsc::Sender<Bytes>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

/// A bound, not yet running client.
pub struct Client {
    state: ClientState,
    listener: TcpListener,
    events_rx: mpsc::Receiver<Event>,
    commands_rx: mpsc::Receiver<ClientCommand>,
}

/// Everything the client task mutates.
struct ClientState {
    settings: ClientSettings,
    local: LocalNode,
    governor: Governor,
    connections: HashMap<ConnectionId, ConnEntry>,
    pending_dials: HashSet<PeerId>,
    next_conn_id: u64,
    events_tx: mpsc::Sender<Event>,
}

impl Client {
    /// Bind the listener and pick this process's nonce.
    pub async fn bind(
        settings: ClientSettings,
        governor: Governor,
    ) -> Result<(Client, ClientHandle), ClientError> {
        let listener = TcpListener::bind(settings.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let nonce: u64 = rand::random();

        let local = LocalNode {
            nonce,
            listen_port: local_addr.port(),
            services: settings.services,
            protocol_version: settings.protocol_version,
            stream: settings.stream,
            user_agent: settings.user_agent.clone(),
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);

        tracing::info!(
            listen = %local_addr,
            known_peers = governor.registry().len(),
            "client bound"
        );

        let client = Client {
            state: ClientState {
                settings,
                local,
                governor,
                connections: HashMap::new(),
                pending_dials: HashSet::new(),
                next_conn_id: 0,
                events_tx,
            },
            listener,
            events_rx,
            commands_rx,
        };
        let handle = ClientHandle {
            tx: commands_tx,
            local_addr,
            nonce,
        };
        Ok((client, handle))
    }

    /// Run until `ClientHandle::shutdown` or until every handle is dropped.
    pub async fn run(self) -> Result<(), ClientError> {
        let Client {
            mut state,
            listener,
            mut events_rx,
            mut commands_rx,
        } = self;

        let acceptor = tokio::spawn(accept_loop(listener, state.events_tx.clone()));

        let mut housekeeping =
            tokio::time::interval(state.settings.targets.housekeeping_interval());
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = housekeeping.tick() => {
                    state.housekeeping(Instant::now());
                }
                Some(event) = events_rx.recv() => {
                    state.handle_event(event, Instant::now());
                }
                command = commands_rx.recv() => match command {
                    Some(ClientCommand::Shutdown) | None => break,
                    Some(command) => state.handle_command(command, Instant::now()),
                },
            }
        }

        tracing::info!(connections = state.connections.len(), "client shutting down");
        acceptor.abort();
        state.close_all(Instant::now());
        Ok(())
    }
}

impl ClientState {
    fn housekeeping(&mut self, now: Instant) {
        self.expire_connections(now);

        let outbound = self.outbound_targets();
        let actions = self
            .governor
            .tick(&outbound, now, &mut rand::thread_rng());
        for peer in actions.connect {
            self.dial(peer);
        }
    }

    /// Peers with an open outbound connection or a dial in flight.
    fn outbound_targets(&self) -> HashSet<PeerId> {
        self.connections
            .values()
            .filter(|e| e.conn.direction() == Direction::Outbound)
            .filter_map(|e| e.conn.peer())
            .chain(self.pending_dials.iter().copied())
            .collect()
    }

    fn expire_connections(&mut self, now: Instant) {
        let expired: Vec<(ConnectionId, CloseReason)> = self
            .connections
            .iter()
            .filter_map(|(id, e)| {
                e.conn
                    .check_timeouts(
                        now,
                        self.settings.handshake_timeout,
                        self.settings.inactivity_timeout,
                    )
                    .map(|reason| (*id, reason))
            })
            .collect();
        for (id, reason) in expired {
            tracing::info!(conn = %id, %reason, "closing connection");
            self.unregister(id, now);
        }
    }

    fn dial(&mut self, id: PeerId) {
        let Some(peer) = self.governor.peer(id) else {
            return;
        };
        let host = peer.host.clone();
        let port = peer.port;
        tracing::info!(peer = %peer.addr_string(), "connecting");

        self.pending_dials.insert(id);
        let events = self.events_tx.clone();
        let timeout = self.settings.dial_timeout;
        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await
                {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")),
                };
            let _ = events.send(Event::Dialed { peer: id, result }).await;
        });
    }

    fn handle_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::Accepted(stream, remote) => {
                self.register(Connection::inbound(remote, now), stream, now);
                let inbound = self
                    .connections
                    .values()
                    .filter(|e| e.conn.direction() == Direction::Inbound)
                    .count();
                if self.governor.inbound_over_cap(inbound) {
                    tracing::warn!(
                        inbound,
                        max = self.governor.targets().max_inbound,
                        "inbound connections above cap"
                    );
                }
            }
            Event::Dialed { peer, result } => {
                self.pending_dials.remove(&peer);
                match result {
                    Ok(stream) => {
                        let remote = match stream.peer_addr() {
                            Ok(addr) => addr,
                            Err(e) => {
                                tracing::debug!(%peer, "dialed socket has no peer address: {e}");
                                self.governor.mark_dial_failed(peer, now);
                                return;
                            }
                        };
                        let services = self.governor.peer(peer).map_or(0, |p| p.services);
                        tracing::info!(%remote, "connection established");
                        let conn = Connection::outbound(peer, remote, services, now);
                        self.register(conn, stream, now);
                    }
                    Err(e) => {
                        tracing::debug!(%peer, "dial failed: {e}");
                        self.governor.mark_dial_failed(peer, now);
                    }
                }
            }
            Event::Data(id, data) => {
                let Some(entry) = self.connections.get_mut(&id) else {
                    return;
                };
                let actions = entry.conn.receive_data(&self.local, &data, now);
                self.apply(id, actions, now);
            }
            Event::Closed(id) => self.unregister(id, now),
        }
    }

    fn handle_command(&mut self, command: ClientCommand, now: Instant) {
        match command {
            ClientCommand::Broadcast(frame, reply) => {
                let _ = reply.send(self.broadcast(frame, now));
            }
            ClientCommand::AddPeer {
                host,
                port,
                services,
                reply,
            } => {
                let id = self.governor.add_peer(host, port, services);
                let _ = reply.send(id);
            }
            ClientCommand::Snapshot(reply) => {
                let mut infos: Vec<ConnectionInfo> = self
                    .connections
                    .iter()
                    .map(|(id, e)| e.conn.info(*id))
                    .collect();
                infos.sort_by_key(|i| i.id);
                let _ = reply.send(infos);
            }
            ClientCommand::Shutdown => {}
        }
    }

    fn register(&mut self, mut conn: Connection, stream: TcpStream, now: Instant) {
        let id = ConnectionId(self.next_conn_id);
        self.next_conn_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(conn = %id, "set_nodelay failed: {e}");
        }
        let (reader, writer) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(self.settings.write_queue);
        let reader_task = tokio::spawn(read_loop(id, reader, self.events_tx.clone()));
        let writer_task = tokio::spawn(write_loop(
            id,
            writer,
            write_rx,
            self.settings.write_timeout,
            self.events_tx.clone(),
        ));

        let actions = conn.on_established(&self.local);
        tracing::debug!(
            conn = %id,
            remote = %conn.remote_addr(),
            direction = ?conn.direction(),
            "connection registered"
        );
        self.connections.insert(
            id,
            ConnEntry {
                conn,
                writer: write_tx,
                reader_task,
                writer_task,
            },
        );
        self.apply(id, actions, now);
    }

    /// Drop the connection from the active set. A connection that never
    /// handshaked stamps its peer's failure time.
    fn unregister(&mut self, id: ConnectionId, now: Instant) {
        let Some(entry) = self.connections.remove(&id) else {
            return;
        };
        // The writer drains what is already queued, then shuts the socket.
        // A peer that stops reading is cut off by the write timeout.
        entry.reader_task.abort();
        let handshaked = entry.conn.is_handshaked();
        if !handshaked {
            if let Some(peer) = entry.conn.peer() {
                self.governor.mark_dial_failed(peer, now);
            }
        }
        tracing::info!(
            conn = %id,
            remote = %entry.conn.remote_addr(),
            handshaked,
            "connection closed"
        );
    }

    fn apply(&mut self, id: ConnectionId, actions: Vec<Action>, now: Instant) {
        for action in actions {
            match action {
                Action::Send(frame) => {
                    self.send_to(id, frame, now);
                }
                Action::Close(_) => {
                    self.unregister(id, now);
                    return;
                }
                Action::Handshaked => {
                    let handshaked = self
                        .connections
                        .values()
                        .filter(|e| e.conn.is_handshaked())
                        .count();
                    tracing::debug!(conn = %id, handshaked, "peer ready");
                }
            }
        }
    }

    fn send_to(&mut self, id: ConnectionId, frame: Bytes, now: Instant) -> bool {
        let Some(entry) = self.connections.get_mut(&id) else {
            return false;
        };
        match entry.writer.try_send(frame) {
            Ok(()) => {
                entry.conn.record_sent(now);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn = %id, "write queue full, dropping frame");
                false
            }
            // Writer already gone; its Closed event unregisters us.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue `frame` to every handshaked connection. Never waits on a slow
    /// peer; each failure only affects that peer.
    fn broadcast(&mut self, frame: Bytes, now: Instant) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, e)| e.conn.is_handshaked())
            .map(|(id, _)| *id)
            .collect();
        let delivered = targets
            .into_iter()
            .filter(|id| self.send_to(*id, frame.clone(), now))
            .count();
        tracing::debug!(delivered, "broadcast");
        delivered
    }

    fn close_all(&mut self, now: Instant) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.connections.get(&id) {
                entry.writer_task.abort();
            }
            tracing::debug!(conn = %id, reason = %CloseReason::Shutdown, "closing connection");
            self.unregister(id, now);
        }
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::Sender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tracing::info!(%remote, "inbound connection");
                if events.send(Event::Accepted(stream, remote)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_loop(id: ConnectionId, mut reader: OwnedReadHalf, events: mpsc::Sender<Event>) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if events
                    .send(Event::Data(id, buf.split().freeze()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(conn = %id, "read error: {e}");
                break;
            }
        }
    }
    let _ = events.send(Event::Closed(id)).await;
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    write_timeout: Duration,
    events: mpsc::Sender<Event>,
) {
    while let Some(frame) = queue.recv().await {
        match tokio::time::timeout(write_timeout, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(conn = %id, "write error: {e}");
                let _ = events.send(Event::Closed(id)).await;
                return;
            }
            Err(_) => {
                tracing::debug!(conn = %id, "write stalled, dropping socket");
                let _ = events.send(Event::Closed(id)).await;
                return;
            }
        }
    }
    if tokio::time::timeout(write_timeout, writer.shutdown()).await.is_err() {
        tracing::debug!(conn = %id, "shutdown stalled, dropping socket");
    }
}
