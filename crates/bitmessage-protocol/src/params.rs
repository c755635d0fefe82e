//! Protocol parameters -- the values peers on one network must agree on.
//!
//! Connection caps and retry timing are node-local decisions and live in
//! the governor, not here.

/// A named set of network-wide protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Human-readable network name.
    pub name: &'static str,
    /// Frame magic value.
    pub magic: [u8; 4],
    /// Highest protocol version we speak. Negotiated down per connection.
    pub protocol_version: u32,
    /// Stream of interest. This client participates in exactly one.
    pub stream: u64,
    /// Services bitmask advertised in `version`.
    pub services: u64,
    /// Default TCP listening port.
    pub default_port: u16,
    /// Frames whose declared payload exceeds this are discarded.
    pub max_payload_bytes: usize,
    /// Seconds without traffic before a handshaked connection is dropped.
    /// Kept alive by ping/pong.
    pub inactivity_timeout_secs: u64,
}

/// Main network.
pub const MAINNET: ProtocolParams = ProtocolParams {
    name: "mainnet",
    magic: [0xE9, 0xBE, 0xB4, 0xD9],
    protocol_version: 2,
    stream: 1,
    services: 1, // NODE_NETWORK
    default_port: 8444,
    max_payload_bytes: 180_000_000,
    inactivity_timeout_secs: 600,
};
