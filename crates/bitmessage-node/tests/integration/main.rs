//! Integration test entry point for bitmessage-node.
//!
//! Run with: cargo test --test integration

mod broadcast;
mod handshake;
mod harness;
