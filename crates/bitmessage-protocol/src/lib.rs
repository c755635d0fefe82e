//! Bitmessage Protocol -- wire primitives, message types, frame codec.
//!
//! TCP between peers. Every frame is a 24-byte header (magic, command,
//! length, checksum) followed by the payload. All integers big-endian.

pub mod codec;
pub mod messages;
pub mod params;
pub mod varint;

pub use codec::{checksum, create, parse, MessageCodec};
pub use messages::*;
pub use params::{ProtocolParams, MAINNET};

/// Frame magic value: E9 BE B4 D9.
pub const MAGIC: [u8; 4] = MAINNET.magic;

/// Frame header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Width of the null-padded command field.
pub const COMMAND_SIZE: usize = 12;

/// Payloads above this are dropped unparsed (180 MB).
pub const MAX_PAYLOAD_SIZE: usize = MAINNET.max_payload_bytes;

/// Protocol version we advertise in `version`.
pub const PROTOCOL_VERSION: u32 = MAINNET.protocol_version;

/// The single stream this client participates in.
pub const STREAM: u64 = MAINNET.stream;

/// Services bitmask: NODE_NETWORK.
pub const NODE_NETWORK: u64 = 1;

/// Services we provide (sourced from mainnet parameters).
pub const SERVICES_PROVIDED: u64 = MAINNET.services;

/// Default listening port.
pub const DEFAULT_PORT: u16 = MAINNET.default_port;

/// User agent advertised in `version`.
pub fn user_agent() -> String {
    format!("/bitmessage-rs:{}/", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated input: needed {needed} bytes, {available} available")]
    TruncatedInput { needed: usize, available: usize },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
