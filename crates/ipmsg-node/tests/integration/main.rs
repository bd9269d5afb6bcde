//! Integration test entry point for ipmsg-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod delivery;
mod discovery;
mod file_transfer;
