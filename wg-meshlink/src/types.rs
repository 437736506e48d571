// Shared types between the controllers and the daemon

//! Shared data structures
//!
//! This module defines data structures shared between components: the
//! interface and session records the controllers pass around, the derived
//! connection state, and the configuration file structures.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Name of the virtual interface shared by VPN and mesh traffic
pub const DEFAULT_INTERFACE: &str = "nordlynx";

/// Local address used while only the VPN is in use
pub const DEFAULT_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 5, 0, 2));

/// Port the exit node listens on
pub const DEFAULT_PORT: u16 = 51820;

/// Mark set on packets leaving the tunnel socket
pub const DEFAULT_FWMARK: u32 = 0xe1f1;

/// Routing table used for policy-based routing
pub const DEFAULT_TABLE_ID: u32 = 205;

/// Priority of the policy rule; the suppress rule sits just below it
pub const DEFAULT_RULE_PRIORITY: u32 = 32000;

/// Bound on connectivity verification after a connect
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Network interface as resolved from the OS
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interface {
    /// Kernel interface name
    pub name: String,
    /// Kernel interface index
    pub index: u32,
}

/// Credentials supplied by the account API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Base64 private key for the VPN identity
    pub private_key: String,
}

/// Exit node to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerData {
    /// Exit node address
    pub ip: IpAddr,
    /// Exit node public key
    pub public_key: String,
}

/// Values of the last successful Start, used to restore the VPN link
/// after mesh mode changes the interface address and key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParameters {
    /// VPN private key
    pub private_key: String,
    /// Exit node address
    pub server_ip: IpAddr,
    /// Exit node public key
    pub server_public_key: String,
}

/// VPN link state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnState {
    /// Connected to an exit node
    Connected,
    /// No exit node connection
    Exited,
}

/// Snapshot of the connection controller's mode flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// Tunnel interface exists
    pub tunnel_present: bool,
    /// VPN connection is up
    pub active: bool,
    /// Mesh mode is on
    pub mesh_enabled: bool,
}

impl ConnectionState {
    /// The tunnel exists exactly when the VPN or mesh needs it
    pub fn is_consistent(&self) -> bool {
        self.tunnel_present == (self.active || self.mesh_enabled)
    }
}

/// Tunables for the connection controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Tunnel interface name
    pub interface: String,
    /// Address used while mesh is off
    pub default_address: IpAddr,
    /// Mark for packets leaving the tunnel socket
    pub fwmark: u32,
    /// Fixed MTU; derived from the uplink when unset
    pub mtu: Option<u32>,
    /// Connectivity verification deadline
    pub connect_timeout: Duration,
    /// Exit node port
    pub port: u16,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE.to_string(),
            default_address: DEFAULT_ADDRESS,
            fwmark: DEFAULT_FWMARK,
            mtu: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            port: DEFAULT_PORT,
        }
    }
}

impl ControllerSettings {
    /// Settings for the daemon configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            interface: config.general.interface.clone(),
            default_address: DEFAULT_ADDRESS,
            fwmark: config.general.fwmark,
            mtu: config.general.mtu,
            connect_timeout: Duration::from_secs(config.general.connect_timeout),
            port: config.vpn.port,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Daemon-wide options
    #[serde(default)]
    pub general: GeneralConfig,
    /// Exit node connection
    pub vpn: VpnConfig,
    /// Mesh membership, mesh stays off when absent
    #[serde(default)]
    pub mesh: Option<MeshConfig>,
    /// Policy routing
    #[serde(default)]
    pub routing: RoutingConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Tunnel interface name
    #[serde(default = "default_interface")]
    pub interface: String,
    /// env_logger filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Mark for packets leaving the tunnel socket
    #[serde(default = "default_fwmark")]
    pub fwmark: u32,
    /// Seconds to wait for the exit node to report a live link
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Fixed tunnel MTU
    #[serde(default)]
    pub mtu: Option<u32>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            log_level: default_log_level(),
            fwmark: default_fwmark(),
            connect_timeout: default_connect_timeout(),
            mtu: None,
        }
    }
}

/// Exit node and credentials
#[derive(Debug, Deserialize, Clone)]
pub struct VpnConfig {
    /// Base64 private key
    pub private_key: String,
    /// Exit node address
    pub server_ip: IpAddr,
    /// Exit node public key
    pub server_public_key: String,
    /// Exit node port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Mesh membership of this device
#[derive(Debug, Deserialize, Clone)]
pub struct MeshConfig {
    /// Tunnel address while mesh is on
    pub address: IpAddr,
    /// Base64 mesh private key
    pub private_key: String,
    /// Raw mesh map pushed to the engine after enabling
    #[serde(default)]
    pub map_file: Option<PathBuf>,
}

/// Policy-based routing options
#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    /// Start with policy routing on
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Routing table for tunnel traffic
    #[serde(default = "default_table_id")]
    pub table_id: u32,
    /// Policy rule priority
    #[serde(default = "default_rule_priority")]
    pub priority: u32,
    /// Also install IPv6 rules
    #[serde(default)]
    pub ipv6: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            table_id: default_table_id(),
            priority: default_rule_priority(),
            ipv6: false,
        }
    }
}

// Default values for configuration
fn default_interface() -> String {
    DEFAULT_INTERFACE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_fwmark() -> u32 {
    DEFAULT_FWMARK
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_table_id() -> u32 {
    DEFAULT_TABLE_ID
}

fn default_rule_priority() -> u32 {
    DEFAULT_RULE_PRIORITY
}
