// WireGuard engine backed by wireguard-control

//! WireGuard engine backed by `wireguard-control`
//!
//! [`WgEngine`] implements [`Engine`] on top of the kernel module or the
//! user-space implementation. Connect results are confirmed by watching the
//! exit node's handshake on a background thread, which reports through the
//! [`EventSink`] the engine was built with.

use crate::engine::{encode_event, Adapter, Engine, EngineStatus, PeerStatus, STATE_CONNECTED};
use crate::event_monitor::EventSink;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wireguard_control::{
    AllowedIp, Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder,
};

/// Keepalive for peers behind NAT (seconds)
const PERSISTENT_KEEPALIVE: u16 = 25;

/// How often the handshake watcher polls the device
const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// State reported for peers that have not completed a handshake
const STATE_CONNECTING: &str = "connecting";

/// Mesh membership pushed through [`Engine::set_meshnet`]
#[derive(Debug, Deserialize)]
pub struct MeshMap {
    /// Every other mesh member
    #[serde(default)]
    pub peers: Vec<MeshPeer>,
}

/// One mesh member
#[derive(Debug, Deserialize)]
pub struct MeshPeer {
    /// Peer public key
    pub public_key: String,
    /// Mesh addresses routed to the peer
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
    /// First entry is used
    #[serde(default)]
    pub endpoints: Vec<SocketAddr>,
}

/// Decode a mesh map, `BadConfig` if it is not valid JSON of the right shape
pub fn parse_mesh_map(raw: &str) -> Result<MeshMap, EngineStatus> {
    serde_json::from_str(raw).map_err(|e| {
        log::warn!("Rejecting mesh map: {}", e);
        EngineStatus::BadConfig
    })
}

fn host_prefix(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn peer_state(handshaken: bool) -> &'static str {
    if handshaken {
        STATE_CONNECTED
    } else {
        STATE_CONNECTING
    }
}

fn parse_key(key: &str) -> Result<Key, EngineStatus> {
    Key::from_base64(key).map_err(|_| EngineStatus::InvalidKey)
}

fn io_status(result: std::io::Result<()>, what: &str) -> EngineStatus {
    match result {
        Ok(()) => EngineStatus::Ok,
        Err(e) => {
            log::error!("WireGuard {} failed: {}", what, e);
            EngineStatus::Error
        }
    }
}

#[derive(Clone, Copy)]
struct Running {
    name: InterfaceName,
    backend: Backend,
}

#[derive(Default)]
struct EngineState {
    running: Option<Running>,
    exit_node: Option<Key>,
    mesh_peers: Vec<Key>,
}

/// [`Engine`] driving a WireGuard device
pub struct WgEngine {
    sink: EventSink,
    watch_timeout: Duration,
    /// Bumped whenever a pending handshake watch becomes stale
    watch_generation: Arc<AtomicU64>,
    state: Mutex<EngineState>,
}

impl WgEngine {
    /// `watch_timeout` bounds how long a connect is watched for a handshake
    pub fn new(sink: EventSink, watch_timeout: Duration) -> Self {
        Self {
            sink,
            watch_timeout,
            watch_generation: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(EngineState::default()),
        }
    }

    fn with_running(
        &self,
        f: impl FnOnce(&mut EngineState, Running) -> EngineStatus,
    ) -> EngineStatus {
        let Ok(mut state) = self.state.lock() else {
            return EngineStatus::LockError;
        };
        let running = state.running;
        match running {
            Some(running) => f(&mut *state, running),
            None => EngineStatus::NotStarted,
        }
    }

    fn cancel_watch(&self) -> u64 {
        self.watch_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn watch_handshake(&self, running: Running, key: Key, public_key: String) {
        let generation = self.cancel_watch();
        let current = self.watch_generation.clone();
        let sink = self.sink.clone();
        // no deadline when the timeout does not fit in an Instant
        let deadline = Instant::now().checked_add(self.watch_timeout);

        std::thread::spawn(move || {
            while deadline.map_or(true, |deadline| Instant::now() < deadline) {
                if current.load(Ordering::SeqCst) != generation {
                    return;
                }
                if let Ok(device) = Device::get(&running.name, running.backend) {
                    let handshaken = device.peers.iter().any(|peer| {
                        peer.config.public_key == key && peer.stats.last_handshake_time.is_some()
                    });
                    if handshaken {
                        sink.deliver(&encode_event(STATE_CONNECTED, &public_key));
                        return;
                    }
                }
                std::thread::sleep(HANDSHAKE_POLL_INTERVAL);
            }
            log::debug!("No handshake with {} before the watch expired", public_key);
        });
    }
}

impl Engine for WgEngine {
    fn start_named(&self, private_key: &str, adapter: Adapter, name: &str) -> EngineStatus {
        let Ok(mut state) = self.state.lock() else {
            return EngineStatus::LockError;
        };
        if state.running.is_some() {
            return EngineStatus::AlreadyStarted;
        }

        let Ok(iface) = name.parse::<InterfaceName>() else {
            return EngineStatus::InvalidString;
        };
        let key = match parse_key(private_key) {
            Ok(key) => key,
            Err(status) => return status,
        };
        let backend = match adapter {
            Adapter::Kernel => Backend::Kernel,
            Adapter::Userspace => Backend::Userspace,
        };

        let result = DeviceUpdate::new()
            .set_private_key(key)
            .apply(&iface, backend);
        let status = io_status(result, "device creation");
        if status.is_ok() {
            log::info!("WireGuard device {} started ({:?})", name, adapter);
            *state = EngineState {
                running: Some(Running {
                    name: iface,
                    backend,
                }),
                ..EngineState::default()
            };
        }
        status
    }

    fn stop(&self) -> EngineStatus {
        self.cancel_watch();
        let Ok(mut state) = self.state.lock() else {
            return EngineStatus::LockError;
        };
        let Some(running) = state.running else {
            return EngineStatus::NotStarted;
        };

        let result = Device::get(&running.name, running.backend).and_then(Device::delete);
        let status = io_status(result, "device removal");
        if status.is_ok() {
            *state = EngineState::default();
        }
        status
    }

    fn connect_to_exit_node(
        &self,
        public_key: &str,
        allowed_range: &str,
        endpoint: SocketAddr,
    ) -> EngineStatus {
        let mut watch = None;
        let status = self.with_running(|state, running| {
            let key = match parse_key(public_key) {
                Ok(key) => key,
                Err(status) => return status,
            };
            let Ok(allowed) = allowed_range.parse::<AllowedIp>() else {
                return EngineStatus::InvalidString;
            };

            let peer = PeerConfigBuilder::new(&key)
                .set_endpoint(endpoint)
                .replace_allowed_ips()
                .add_allowed_ip(allowed.address, allowed.cidr)
                .set_persistent_keepalive_interval(PERSISTENT_KEEPALIVE);
            let status = io_status(
                DeviceUpdate::new()
                    .add_peer(peer)
                    .apply(&running.name, running.backend),
                "exit node setup",
            );
            if status.is_ok() {
                state.exit_node = Some(key.clone());
                watch = Some((running, key));
            }
            status
        });

        if let Some((running, key)) = watch {
            self.watch_handshake(running, key, public_key.to_string());
        }
        status
    }

    fn disconnect_from_exit_nodes(&self) -> EngineStatus {
        self.cancel_watch();
        self.with_running(|state, running| {
            let Some(key) = state.exit_node.clone() else {
                return EngineStatus::Ok;
            };
            let status = io_status(
                DeviceUpdate::new()
                    .remove_peer_by_key(&key)
                    .apply(&running.name, running.backend),
                "exit node removal",
            );
            if status.is_ok() {
                state.exit_node = None;
            }
            status
        })
    }

    fn set_meshnet(&self, raw: &str) -> EngineStatus {
        self.with_running(|state, running| {
            let map = match parse_mesh_map(raw) {
                Ok(map) => map,
                Err(status) => return status,
            };

            let mut update = DeviceUpdate::new();
            for old in &state.mesh_peers {
                update = update.remove_peer_by_key(old);
            }

            let mut keys = Vec::with_capacity(map.peers.len());
            for peer in &map.peers {
                let key = match parse_key(&peer.public_key) {
                    Ok(key) => key,
                    Err(status) => return status,
                };
                let mut builder = PeerConfigBuilder::new(&key)
                    .set_persistent_keepalive_interval(PERSISTENT_KEEPALIVE);
                for ip in &peer.ip_addresses {
                    builder = builder.add_allowed_ip(*ip, host_prefix(*ip));
                }
                if let Some(endpoint) = peer.endpoints.first() {
                    builder = builder.set_endpoint(*endpoint);
                }
                update = update.add_peer(builder);
                keys.push(key);
            }

            let status = io_status(
                update.apply(&running.name, running.backend),
                "mesh update",
            );
            if status.is_ok() {
                log::info!("Mesh map installed with {} peers", keys.len());
                state.mesh_peers = keys;
            }
            status
        })
    }

    fn set_meshnet_off(&self) -> EngineStatus {
        self.with_running(|state, running| {
            if state.mesh_peers.is_empty() {
                return EngineStatus::Ok;
            }
            let mut update = DeviceUpdate::new();
            for key in &state.mesh_peers {
                update = update.remove_peer_by_key(key);
            }
            let status = io_status(
                update.apply(&running.name, running.backend),
                "mesh removal",
            );
            if status.is_ok() {
                state.mesh_peers.clear();
            }
            status
        })
    }

    fn set_private_key(&self, private_key: &str) -> EngineStatus {
        self.with_running(|_, running| {
            let key = match parse_key(private_key) {
                Ok(key) => key,
                Err(status) => return status,
            };
            io_status(
                DeviceUpdate::new()
                    .set_private_key(key)
                    .apply(&running.name, running.backend),
                "key update",
            )
        })
    }

    fn set_fwmark(&self, mark: u32) -> EngineStatus {
        self.with_running(|_, running| {
            io_status(
                DeviceUpdate::new()
                    .set_fwmark(mark)
                    .apply(&running.name, running.backend),
                "fwmark update",
            )
        })
    }

    fn notify_network_change(&self) -> EngineStatus {
        // Peers roam on their own; only the running check is meaningful
        self.with_running(|_, running| {
            log::debug!("Network change on {}", running.name);
            EngineStatus::Ok
        })
    }

    fn generate_secret_key(&self) -> String {
        Key::generate_private().to_base64()
    }

    fn generate_public_key(&self, private_key: &str) -> String {
        Key::from_base64(private_key)
            .map(|key| key.get_public().to_base64())
            .unwrap_or_default()
    }

    fn status_snapshot(&self) -> String {
        let running = match self.state.lock() {
            Ok(state) => state.running,
            Err(_) => None,
        };
        let peers: Vec<PeerStatus> = running
            .and_then(|running| Device::get(&running.name, running.backend).ok())
            .map(|device| {
                device
                    .peers
                    .iter()
                    .map(|peer| PeerStatus {
                        public_key: peer.config.public_key.to_base64(),
                        state: peer_state(peer.stats.last_handshake_time.is_some())
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        serde_json::to_string(&peers).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decode_status_map;
    use crate::event_monitor::EventMonitor;

    const KEY_A: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";

    fn engine() -> WgEngine {
        WgEngine::new(EventMonitor::new().sink(), Duration::from_secs(1))
    }

    #[test]
    fn test_operations_before_start_report_not_started() {
        let engine = engine();
        let endpoint: SocketAddr = "1.2.3.4:51820".parse().unwrap();

        assert_eq!(engine.stop(), EngineStatus::NotStarted);
        assert_eq!(
            engine.connect_to_exit_node(KEY_A, "0.0.0.0/0", endpoint),
            EngineStatus::NotStarted
        );
        assert_eq!(engine.disconnect_from_exit_nodes(), EngineStatus::NotStarted);
        assert_eq!(engine.set_meshnet("{\"peers\":[]}"), EngineStatus::NotStarted);
        assert_eq!(engine.set_meshnet_off(), EngineStatus::NotStarted);
        assert_eq!(engine.set_private_key(KEY_A), EngineStatus::NotStarted);
        assert_eq!(engine.set_fwmark(0xe1f1), EngineStatus::NotStarted);
        assert_eq!(engine.notify_network_change(), EngineStatus::NotStarted);
    }

    #[test]
    fn test_huge_watch_timeout_does_not_panic() {
        let engine = WgEngine::new(EventMonitor::new().sink(), Duration::from_secs(u64::MAX));
        let running = Running {
            name: "wgtest0".parse().unwrap(),
            backend: Backend::Userspace,
        };
        let key = Key::from_base64(KEY_A).unwrap();

        engine.watch_handshake(running, key, KEY_A.to_string());
        // stops the watcher thread
        engine.cancel_watch();
    }

    #[test]
    fn test_start_rejects_bad_arguments() {
        let engine = engine();
        assert_eq!(
            engine.start_named(KEY_A, Adapter::Kernel, "name-longer-than-ifnamsiz"),
            EngineStatus::InvalidString
        );
        assert_eq!(
            engine.start_named("not a key", Adapter::Kernel, "wgtest0"),
            EngineStatus::InvalidKey
        );
    }

    #[test]
    fn test_status_snapshot_without_device_is_empty() {
        let snapshot = engine().status_snapshot();
        assert_eq!(snapshot, "[]");
        assert!(decode_status_map(&snapshot).unwrap().is_empty());
    }

    #[test]
    fn test_key_generation() {
        let engine = engine();
        let private = engine.generate_secret_key();
        assert!(Key::from_base64(&private).is_ok());

        let public = engine.generate_public_key(&private);
        assert!(Key::from_base64(&public).is_ok());
        assert_ne!(public, private);
        assert_eq!(engine.generate_public_key(&private), public);
        assert_eq!(engine.generate_public_key("garbage"), "");
    }

    #[test]
    fn test_parse_mesh_map() {
        let map = parse_mesh_map(
            r#"{"peers":[{"public_key":"k","ip_addresses":["100.64.0.5"],"endpoints":["5.6.7.8:51820"]}]}"#,
        )
        .unwrap();
        assert_eq!(map.peers.len(), 1);
        assert_eq!(map.peers[0].ip_addresses, vec!["100.64.0.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(map.peers[0].endpoints[0].port(), 51820);

        let empty = parse_mesh_map("{}").unwrap();
        assert!(empty.peers.is_empty());

        assert_eq!(parse_mesh_map("not json").unwrap_err(), EngineStatus::BadConfig);
        assert_eq!(
            parse_mesh_map(r#"{"peers":[{"ip_addresses":[]}]}"#).unwrap_err(),
            EngineStatus::BadConfig
        );
    }

    #[test]
    fn test_peer_state_and_prefix() {
        assert_eq!(peer_state(true), "connected");
        assert_eq!(peer_state(false), "connecting");
        assert_eq!(host_prefix("100.64.0.5".parse().unwrap()), 32);
        assert_eq!(host_prefix("fd00::5".parse().unwrap()), 128);
    }
}
