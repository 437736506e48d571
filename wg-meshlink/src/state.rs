// Connection state machine for VPN and mesh modes

//! Connection state machine
//!
//! [`ConnectionController`] coordinates plain VPN connections and the mesh
//! overlay, which share one tunnel interface:
//!
//! 1. Mesh off, Start: the tunnel is created with the VPN key and the default
//!    address, then the exit node is connected.
//! 2. Mesh on, Start: the existing tunnel (mesh address and key) is reused and
//!    only the connection is made.
//! 3. Mesh on, Stop: the connection is dropped, the tunnel stays.
//! 4. Mesh off, Stop: the connection is dropped and the tunnel destroyed.
//! 5. VPN connected, Enable: the tunnel is switched to the mesh address and
//!    key and the VPN connection is re-established.
//! 6. VPN disconnected, Enable: the tunnel is created with the mesh address
//!    and key.
//! 7. VPN connected, Disable: the tunnel is switched back to the default
//!    address and the key given to Start, and the VPN connection is
//!    re-established.
//! 8. VPN disconnected, Disable: the tunnel is destroyed.
//!
//! After every operation the tunnel exists exactly when the VPN is connected
//! or mesh is enabled.

use crate::engine::{decode_status_map, Engine, EngineStatus, STATE_CONNECTED};
use crate::error::{Error, Result, StepExt};
use crate::event_monitor::EventMonitor;
use crate::link::LinkOps;
use crate::tunnel::TunnelManager;
use crate::types::{
    ConnectionState, ControllerSettings, Credentials, Interface, ServerData, SessionParameters,
    VpnState,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::Mutex;

/// Traffic routed to the exit node
const ALLOWED_RANGE: &str = "0.0.0.0/0";

/// Attempts at pushing a mesh map while the engine is not ready
const REFRESH_ATTEMPTS: u32 = 10;

/// Pause between mesh map attempts
const REFRESH_RETRY_DELAY: Duration = Duration::from_millis(100);

struct Inner<L> {
    tunnel: TunnelManager<L>,
    active: bool,
    mesh_enabled: bool,
    vpn_state: VpnState,
    session: Option<SessionParameters>,
}

/// Orchestrates the tunnel, the engine connection and mesh mode
pub struct ConnectionController<E, L> {
    engine: E,
    monitor: EventMonitor,
    settings: ControllerSettings,
    inner: Mutex<Inner<L>>,
}

impl<E: Engine, L: LinkOps> ConnectionController<E, L> {
    /// `monitor` must be the monitor whose sink the engine reports events to
    pub fn new(engine: E, monitor: EventMonitor, link: L, settings: ControllerSettings) -> Self {
        let tunnel = TunnelManager::new(
            link,
            settings.interface.clone(),
            settings.fwmark,
            settings.mtu,
        );
        Self {
            engine,
            monitor,
            settings,
            inner: Mutex::new(Inner {
                tunnel,
                active: false,
                mesh_enabled: false,
                vpn_state: VpnState::Exited,
                session: None,
            }),
        }
    }

    /// Connect to the exit node, creating the tunnel if mesh has not
    pub async fn start(&self, creds: &Credentials, server: &ServerData) -> Result<()> {
        let mut inner = self.inner.lock().await;

        inner
            .tunnel
            .open(
                &self.engine,
                self.settings.default_address,
                &creds.private_key,
            )
            .await
            .step("opening the tunnel")?;

        self.connect(&mut inner, server.ip, &server.public_key)
            .await?;

        // Needed to restore the VPN link if mesh is enabled and disabled
        // before Stop
        inner.session = Some(SessionParameters {
            private_key: creds.private_key.clone(),
            server_ip: server.ip,
            server_public_key: server.public_key.clone(),
        });
        Ok(())
    }

    /// Drop the VPN connection; the tunnel survives while mesh needs it
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        self.disconnect(&mut inner)
            .step("disconnecting from the engine")?;

        if !inner.mesh_enabled {
            self.close_tunnel(&mut inner)
                .step("closing the tunnel")?;
        }
        Ok(())
    }

    /// Switch the tunnel to mesh mode with the given address and key
    ///
    /// On failure mesh is disabled again and the original error returned.
    pub async fn enable(&self, ip: IpAddr, private_key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let result = self.enable_mesh(&mut inner, ip, private_key).await;
        if let Err(err) = &result {
            log::error!("Enabling mesh failed: {}", err);
            if let Err(rollback) = self.disable_mesh(&mut inner).await {
                log::error!("Rolling back mesh enable: {}", rollback);
                if !inner.active && !inner.mesh_enabled {
                    self.close_tunnel_quietly(&mut inner);
                }
            }
        }
        result
    }

    /// Leave mesh mode
    pub async fn disable(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.disable_mesh(&mut inner).await
    }

    async fn enable_mesh(&self, inner: &mut Inner<L>, ip: IpAddr, private_key: &str) -> Result<()> {
        inner
            .tunnel
            .open(&self.engine, ip, private_key)
            .await
            .step("opening the tunnel")?;

        // The tunnel already carries a VPN connection with the VPN key and
        // address, so the connection has to be re-made with the mesh ones
        if let (true, Some(session)) = (inner.active, inner.session.clone()) {
            self.disconnect(inner)
                .step("disconnecting from the engine")?;
            inner
                .tunnel
                .update(&self.engine, private_key, ip)
                .await
                .step("updating the tunnel")?;
            self.connect(inner, session.server_ip, &session.server_public_key)
                .await
                .step("reconnecting to server")?;
        }

        inner.mesh_enabled = true;
        log::info!("Mesh enabled with address {}", ip);
        Ok(())
    }

    async fn disable_mesh(&self, inner: &mut Inner<L>) -> Result<()> {
        // Without a tunnel the engine is not running, so mesh is already off
        if !inner.tunnel.is_open() {
            inner.mesh_enabled = false;
            return Ok(());
        }

        self.engine
            .set_meshnet_off()
            .into_result("disabling mesh")?;
        let was_enabled = std::mem::replace(&mut inner.mesh_enabled, false);
        log::info!("Mesh disabled");

        if !inner.active {
            return self
                .close_tunnel(inner)
                .step("closing the tunnel");
        }

        if was_enabled {
            // The exit node will stop accepting the mesh key and address once
            // the device leaves the mesh map
            if let Err(err) = self.restore_vpn(inner).await {
                if !inner.active {
                    self.close_tunnel_quietly(inner);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    async fn restore_vpn(&self, inner: &mut Inner<L>) -> Result<()> {
        let Some(session) = inner.session.clone() else {
            return Ok(());
        };

        self.disconnect(inner)
            .step("disconnecting from the engine")?;
        inner
            .tunnel
            .update(
                &self.engine,
                &session.private_key,
                self.settings.default_address,
            )
            .await
            .step("restoring the tunnel")?;
        self.connect(inner, session.server_ip, &session.server_public_key)
            .await
            .step("reconnecting to server")
    }

    /// Connect to the exit node and wait until it reports a live link
    async fn connect(
        &self,
        inner: &mut Inner<L>,
        server_ip: IpAddr,
        server_public_key: &str,
    ) -> Result<()> {
        // Listen before connecting so the event cannot be missed
        let pending = self
            .monitor
            .await_state(
                server_public_key,
                STATE_CONNECTED,
                self.settings.connect_timeout,
            )
            .await;

        let endpoint = SocketAddr::new(server_ip, self.settings.port);
        if let Err(err) = self
            .engine
            .connect_to_exit_node(server_public_key, ALLOWED_RANGE, endpoint)
            .into_result("connecting to the exit node")
        {
            drop(pending);
            // mesh still needs the tunnel
            if !inner.mesh_enabled {
                self.close_tunnel_quietly(inner);
            }
            return Err(err);
        }

        if !pending.outcome().await {
            log::warn!(
                "No connectivity through {} within {:?}, disconnecting",
                server_ip,
                self.settings.connect_timeout
            );
            if let Err(e) = self.disconnect(inner) {
                log::error!("Disconnecting after failed verification: {}", e);
            }
            if !inner.mesh_enabled {
                self.close_tunnel_quietly(inner);
            }
            return Err(Error::ConnectivityTimeout {
                server: server_ip.to_string(),
            });
        }

        inner.active = true;
        inner.vpn_state = VpnState::Connected;
        log::info!("Connected to {}", endpoint);
        Ok(())
    }

    fn disconnect(&self, inner: &mut Inner<L>) -> Result<()> {
        self.engine
            .disconnect_from_exit_nodes()
            .into_result("disconnecting from exit nodes")?;
        inner.active = false;
        inner.vpn_state = VpnState::Exited;
        Ok(())
    }

    fn close_tunnel(&self, inner: &mut Inner<L>) -> Result<()> {
        let was_open = inner.tunnel.is_open();
        inner.tunnel.close(&self.engine)?;
        if was_open {
            // No connection outlives the interface
            inner.active = false;
            inner.vpn_state = VpnState::Exited;
            inner.session = None;
        }
        Ok(())
    }

    fn close_tunnel_quietly(&self, inner: &mut Inner<L>) {
        if let Err(e) = self.close_tunnel(inner) {
            log::error!("Closing the tunnel: {}", e);
        }
    }

    /// Push a mesh membership update to the engine
    ///
    /// Retried while the engine reports it is not ready yet.
    pub async fn refresh(&self, raw: &str) -> Result<()> {
        let inner = self.inner.lock().await;
        if !inner.tunnel.is_open() {
            return Ok(());
        }

        let mut attempt = 1;
        loop {
            let status = self.engine.set_meshnet(raw);
            if status.is_ok() {
                return Ok(());
            }
            if status != EngineStatus::NotStarted || attempt >= REFRESH_ATTEMPTS {
                return status.into_result("refreshing meshnet");
            }
            log::debug!(
                "Engine not ready for mesh map (attempt {}/{})",
                attempt,
                REFRESH_ATTEMPTS
            );
            attempt += 1;
            tokio::time::sleep(REFRESH_RETRY_DELAY).await;
        }
    }

    /// Peer public key to state, as reported by the engine
    pub async fn status_map(&self) -> Result<HashMap<String, String>> {
        let _inner = self.inner.lock().await;
        decode_status_map(&self.engine.status_snapshot())
    }

    /// Tell the engine the underlying network changed
    pub async fn network_change(&self) -> Result<()> {
        let _inner = self.inner.lock().await;
        self.engine
            .notify_network_change()
            .into_result("notifying network change")
    }

    /// Private key generation
    pub fn private(&self) -> String {
        self.engine.generate_secret_key()
    }

    /// Public key extraction from private
    pub fn public(&self, private_key: &str) -> String {
        self.engine.generate_public_key(private_key)
    }

    /// Whether the VPN connection is up
    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.active
    }

    /// VPN link state
    pub async fn state(&self) -> VpnState {
        self.inner.lock().await.vpn_state
    }

    /// Snapshot of the mode flags
    pub async fn connection_state(&self) -> ConnectionState {
        let inner = self.inner.lock().await;
        ConnectionState {
            tunnel_present: inner.tunnel.is_open(),
            active: inner.active,
            mesh_enabled: inner.mesh_enabled,
        }
    }

    /// Interface of the live tunnel, if any
    pub async fn tunnel_interface(&self) -> Option<Interface> {
        self.inner.lock().await.tunnel.interface().cloned()
    }

    /// Addresses on the live tunnel, empty without one
    pub async fn tunnel_addresses(&self) -> Vec<IpAddr> {
        self.inner
            .lock()
            .await
            .tunnel
            .handle()
            .map(|handle| handle.addresses().to_vec())
            .unwrap_or_default()
    }

    /// Parameters of the last successful Start
    pub async fn session(&self) -> Option<SessionParameters> {
        self.inner.lock().await.session.clone()
    }
}
