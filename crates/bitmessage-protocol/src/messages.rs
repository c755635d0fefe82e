//! Wire message types and per-command payload codecs.
//!
//! Only the handshake pair (`version`, `verack`) carries a decoded payload.
//! The remaining commands are framed and recognised but their payloads are
//! not interpreted; they carry the `Unimplemented` marker.

use bytes::BufMut;

use crate::varint::{
    decode_net_addr, decode_var_int_list, decode_var_str, put_net_addr, put_var_int_list,
    put_var_str, read_i64, read_u32, read_u64, unix_now, NetAddr,
};
use crate::{ProtocolError, COMMAND_SIZE, PROTOCOL_VERSION, STREAM};

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Addr,
    Inv,
    GetData,
    Msg,
    Broadcast,
    Ping,
    Pong,
    Alert,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Version,
        Command::Verack,
        Command::Addr,
        Command::Inv,
        Command::GetData,
        Command::Msg,
        Command::Broadcast,
        Command::Ping,
        Command::Pong,
        Command::Alert,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Addr => "addr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::Msg => "msg",
            Command::Broadcast => "broadcast",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Alert => "alert",
        }
    }

    /// Look up a command by name (trailing nulls already stripped).
    pub fn from_name(name: &[u8]) -> Option<Command> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.name().as_bytes() == name)
    }

    /// Decode the 12-byte header field: strip trailing nulls, then look up.
    pub fn from_wire(field: &[u8]) -> Option<Command> {
        let end = field
            .iter()
            .rposition(|&b| b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        Command::from_name(&field[..end])
    }

    /// Null-padded (or truncated) 12-byte header field.
    pub fn wire_name(&self) -> [u8; COMMAND_SIZE] {
        let mut out = [0u8; COMMAND_SIZE];
        let name = self.name().as_bytes();
        let len = name.len().min(COMMAND_SIZE);
        out[..len].copy_from_slice(&name[..len]);
        out
    }

    /// Everything except the handshake pair waits for a completed handshake.
    pub fn requires_handshake(&self) -> bool {
        !matches!(self, Command::Version | Command::Verack)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Marker for commands whose payload codec does not exist yet.
/// Encodes as an empty payload; decoding ignores the payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unimplemented;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Addr(Unimplemented),
    Inv(Unimplemented),
    GetData(Unimplemented),
    Msg(Unimplemented),
    Broadcast(Unimplemented),
    Ping(Unimplemented),
    Pong(Unimplemented),
    Alert(Unimplemented),
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Verack => Command::Verack,
            Message::Addr(_) => Command::Addr,
            Message::Inv(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::Msg(_) => Command::Msg,
            Message::Broadcast(_) => Command::Broadcast,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::Alert(_) => Command::Alert,
        }
    }

    /// Write the command-specific payload (no header).
    pub fn encode_payload<B: BufMut>(&self, dst: &mut B) {
        match self {
            Message::Version(v) => v.encode(dst),
            Message::Verack => {}
            // TODO: payload codecs for addr/inv/getdata/msg/broadcast/ping/pong/alert.
            _ => {}
        }
    }

    /// Decode a payload already known to belong to `command`.
    pub fn decode_payload(command: Command, payload: &[u8]) -> Result<Message, ProtocolError> {
        match command {
            Command::Version => VersionMessage::decode(payload).map(Message::Version),
            Command::Verack => {
                if !payload.is_empty() {
                    tracing::debug!(
                        len = payload.len(),
                        "verack payload longer than expected"
                    );
                }
                Ok(Message::Verack)
            }
            Command::Addr => Ok(Message::Addr(Unimplemented)),
            Command::Inv => Ok(Message::Inv(Unimplemented)),
            Command::GetData => Ok(Message::GetData(Unimplemented)),
            Command::Msg => Ok(Message::Msg(Unimplemented)),
            Command::Broadcast => Ok(Message::Broadcast(Unimplemented)),
            Command::Ping => Ok(Message::Ping(Unimplemented)),
            Command::Pong => Ok(Message::Pong(Unimplemented)),
            Command::Alert => Ok(Message::Alert(Unimplemented)),
        }
    }
}

/// `version` payload: the first message of every handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub protocol_version: u32,
    pub services: u64,
    /// Unix seconds at creation time.
    pub timestamp: i64,
    /// Address of the node receiving this message.
    pub dest: NetAddr,
    /// Address of the sender. Peers ignore the IP; the port is the
    /// sender's listening port.
    pub src: NetAddr,
    /// Per-process random value; detects connections to ourselves.
    pub nonce: u64,
    pub user_agent: String,
    /// Streams the sender is interested in.
    pub streams: Vec<u64>,
}

impl VersionMessage {
    /// Build with our protocol version, user agent and stream, stamped now.
    /// Services advertised are the source address's services.
    pub fn new(dest: NetAddr, src: NetAddr, nonce: u64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            services: src.services,
            timestamp: unix_now() as i64,
            dest: NetAddr { timed: None, ..dest },
            src: NetAddr { timed: None, ..src },
            nonce,
            user_agent: crate::user_agent(),
            streams: vec![STREAM],
        }
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32(self.protocol_version);
        dst.put_u64(self.services);
        dst.put_i64(self.timestamp);
        put_net_addr(dst, &NetAddr { timed: None, ..self.dest });
        put_net_addr(dst, &NetAddr { timed: None, ..self.src });
        dst.put_u64(self.nonce);
        put_var_str(dst, self.user_agent.as_bytes());
        put_var_int_list(dst, &self.streams);
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (rest, protocol_version) = read_u32(payload)?;
        let (rest, services) = read_u64(rest)?;
        let (rest, timestamp) = read_i64(rest)?;
        let (rest, dest) = decode_net_addr(rest, false)?;
        let (rest, src) = decode_net_addr(rest, false)?;
        let (rest, nonce) = read_u64(rest)?;
        let (rest, user_agent) = decode_var_str(rest)?;
        let (rest, streams) = decode_var_int_list(rest)?;
        if !rest.is_empty() {
            tracing::debug!(
                trailing = rest.len(),
                "version payload longer than expected"
            );
        }
        Ok(Self {
            protocol_version,
            services,
            timestamp,
            dest,
            src,
            nonce,
            user_agent: String::from_utf8_lossy(user_agent).into_owned(),
            streams,
        })
    }

    pub fn is_interested_in(&self, stream: u64) -> bool {
        self.streams.contains(&stream)
    }
}
