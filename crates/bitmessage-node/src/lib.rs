//! Bitmessage Node -- library crate for the P2P network client.
//!
//! Re-exports the connection state machine, client task, bootstrap and
//! config so integration tests and the binary share one code path.

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod connection;

pub use client::{Client, ClientError, ClientHandle, ClientSettings};
pub use connection::{ConnectionId, ConnectionInfo, Direction};

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
