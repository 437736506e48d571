// WireGuard VPN and Mesh Connectivity Library
// Shared modules for the daemon and tests

#![warn(missing_docs)]

//! WireGuard VPN and mesh connectivity core
//!
//! This library manages one tunnel interface shared by a plain VPN connection
//! to an exit node and a peer-to-peer mesh overlay, and the policy routing that
//! sends traffic into it.
//!
//! # Main Components
//!
//! - [`tunnel`]: Tunnel interface lifecycle with kernel/user-space fallback
//! - [`event_monitor`]: Correlation of asynchronous engine events with connects
//! - [`routing`]: Policy routing controller and agents
//! - [`state`]: Connection state machine for VPN and mesh modes
//! - [`engine`]: The engine capability and its JSON contracts
//! - [`wg_engine`]: Engine implementation on top of WireGuard
//! - [`config`]: Configuration file parsing and validation
//! - [`types`]: Shared data structures

pub mod config;
pub mod engine;
pub mod error;
pub mod event_monitor;
pub mod link;
pub mod routing;
pub mod state;
pub mod state_file;
pub mod tunnel;
pub mod types;
pub mod wg_engine;

#[cfg(test)]
mod fakes;

pub use error::{Error, ErrorKind, Result};
