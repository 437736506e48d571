// Tunnel engine capability

//! Tunnel engine capability
//!
//! The cryptographic engine is consumed as an opaque capability. This module
//! defines the operations the controllers rely on, the engine's result codes,
//! and the JSON shapes it uses for state events and status snapshots.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Engine result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Call succeeded
    Ok,
    /// Generic failure
    Error,
    /// Key is not valid base64 of the right length
    InvalidKey,
    /// Configuration payload was rejected
    BadConfig,
    /// Internal engine lock was poisoned
    LockError,
    /// String argument could not be used, e.g. a bad interface name
    InvalidString,
    /// Start was called on a running engine
    AlreadyStarted,
    /// Engine is not ready to accept the call yet
    NotStarted,
}

impl EngineStatus {
    /// Turn a result code into a `Result`, tagging failures with `step`
    pub fn into_result(self, step: &'static str) -> Result<()> {
        match self {
            EngineStatus::Ok => Ok(()),
            status => Err(Error::Engine { step, status }),
        }
    }

    /// Whether the call succeeded
    pub fn is_ok(self) -> bool {
        self == EngineStatus::Ok
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            EngineStatus::Ok => 0,
            EngineStatus::Error => 1,
            EngineStatus::InvalidKey => 2,
            EngineStatus::BadConfig => 3,
            EngineStatus::LockError => 4,
            EngineStatus::InvalidString => 5,
            EngineStatus::AlreadyStarted => 6,
            EngineStatus::NotStarted => 7,
        };
        write!(f, "{:?} ({})", self, code)
    }
}

/// Where tunnel encryption runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    /// Kernel module, tried first
    Kernel,
    /// User-space implementation, used when the kernel adapter is unavailable
    Userspace,
}

/// Operations exposed by the tunnel engine
///
/// Calls block until the engine has processed them. State changes are
/// reported asynchronously through the event callback the engine was built
/// with (see [`crate::event_monitor::EventSink`]).
pub trait Engine: Send + Sync {
    /// Create the interface `name` with `private_key` on the given adapter
    fn start_named(&self, private_key: &str, adapter: Adapter, name: &str) -> EngineStatus;
    /// Tear the interface down
    fn stop(&self) -> EngineStatus;
    /// Add the exit node as a peer routing `allowed_range`
    fn connect_to_exit_node(
        &self,
        public_key: &str,
        allowed_range: &str,
        endpoint: SocketAddr,
    ) -> EngineStatus;
    /// Remove every exit node peer
    fn disconnect_from_exit_nodes(&self) -> EngineStatus;
    /// Replace the mesh peers with the ones in a raw mesh map
    fn set_meshnet(&self, raw: &str) -> EngineStatus;
    /// Remove all mesh peers
    fn set_meshnet_off(&self) -> EngineStatus;
    /// Swap the interface private key
    fn set_private_key(&self, private_key: &str) -> EngineStatus;
    /// Mark outgoing tunnel packets with `mark`
    fn set_fwmark(&self, mark: u32) -> EngineStatus;
    /// The uplink changed, re-establish peer sessions
    fn notify_network_change(&self) -> EngineStatus;
    /// New base64 private key
    fn generate_secret_key(&self) -> String;
    /// Base64 public key for `private_key`, empty if the key is invalid
    fn generate_public_key(&self, private_key: &str) -> String;
    /// Serialized peer list, see [`PeerStatus`]
    fn status_snapshot(&self) -> String;
}

/// Peer state reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// New peer state, e.g. [`STATE_CONNECTED`]
    pub state: String,
    /// Peer the event is about
    pub public_key: String,
}

/// State value reported once a peer link is live
pub const STATE_CONNECTED: &str = "connected";

#[derive(Debug, Serialize, Deserialize)]
struct EventEnvelope {
    body: EventRecord,
}

/// Decode a raw state-event envelope `{"body":{"state":..,"public_key":..}}`
pub fn decode_event(raw: &str) -> Option<EventRecord> {
    serde_json::from_str::<EventEnvelope>(raw)
        .ok()
        .map(|envelope| envelope.body)
}

/// Encode a state-event envelope the way the engine emits it
pub fn encode_event(state: &str, public_key: &str) -> String {
    let envelope = EventEnvelope {
        body: EventRecord {
            state: state.to_string(),
            public_key: public_key.to_string(),
        },
    };
    serde_json::to_string(&envelope).unwrap_or_default()
}

/// Entry of the engine's status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    /// Peer public key
    pub public_key: String,
    /// Current peer state
    pub state: String,
}

/// Decode a status snapshot into a public key -> state map
pub fn decode_status_map(raw: &str) -> Result<HashMap<String, String>> {
    let peers: Vec<PeerStatus> = serde_json::from_str(raw)?;
    Ok(peers
        .into_iter()
        .map(|peer| (peer.public_key, peer.state))
        .collect())
}
