// Virtual interface lifecycle

//! Virtual interface lifecycle
//!
//! [`TunnelManager`] owns the OS interface the engine runs on. Every
//! operation is idempotent: opening an open tunnel and closing a closed one
//! do nothing. A failure partway through `open` stops the engine again so no
//! half-configured interface is left behind.

use crate::engine::{Adapter, Engine};
use crate::error::{Error, Result, StepExt};
use crate::link::LinkOps;
use crate::types::Interface;
use std::net::IpAddr;

/// MTU used when the uplink MTU cannot be determined
pub const DEFAULT_MTU: u32 = 1420;

/// Smallest MTU that still carries IPv6
const MIN_MTU: u32 = 1280;

/// Encapsulation overhead of the tunnel over an IPv6 uplink
const TUNNEL_OVERHEAD: u32 = 80;

/// Pick the tunnel MTU from the uplink MTU
pub fn tunnel_mtu(uplink: Option<u32>) -> u32 {
    match uplink {
        Some(mtu) => mtu.saturating_sub(TUNNEL_OVERHEAD).max(MIN_MTU),
        None => DEFAULT_MTU,
    }
}

/// A live interface together with the addresses assigned to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    interface: Interface,
    addresses: Vec<IpAddr>,
}

impl TunnelHandle {
    /// Interface the tunnel runs on
    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    /// Addresses currently assigned
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }
}

/// Manages the single tunnel interface of a connection controller
pub struct TunnelManager<L> {
    link: L,
    name: String,
    fwmark: u32,
    mtu: Option<u32>,
    /// Set once the kernel adapter failed; later opens go straight to user space
    kernel_unavailable: bool,
    handle: Option<TunnelHandle>,
}

impl<L: LinkOps> TunnelManager<L> {
    /// Manager for interface `name`; `mtu` overrides the uplink-derived MTU
    pub fn new(link: L, name: impl Into<String>, fwmark: u32, mtu: Option<u32>) -> Self {
        Self {
            link,
            name: name.into(),
            fwmark,
            mtu,
            kernel_unavailable: false,
            handle: None,
        }
    }

    /// Whether the tunnel is up
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Live tunnel, if open
    pub fn handle(&self) -> Option<&TunnelHandle> {
        self.handle.as_ref()
    }

    /// Interface of the live tunnel, if open
    pub fn interface(&self) -> Option<&Interface> {
        self.handle.as_ref().map(TunnelHandle::interface)
    }

    /// Whether the kernel adapter failed and user-space is used from now on
    pub fn kernel_unavailable(&self) -> bool {
        self.kernel_unavailable
    }

    /// Create and configure the interface, unless it is already open
    pub async fn open<E: Engine>(
        &mut self,
        engine: &E,
        address: IpAddr,
        private_key: &str,
    ) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        self.remove_stale_interface().await;
        self.start_engine(engine, private_key)?;

        match self.configure(engine, address).await {
            Ok(handle) => {
                log::info!(
                    "Tunnel {} is up with address {}",
                    handle.interface.name,
                    address
                );
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                log::warn!("Tunnel setup failed, stopping the engine: {}", err);
                if let Err(stop_err) = engine.stop().into_result("stopping the engine") {
                    log::error!("Cleanup after failed tunnel setup: {}", stop_err);
                }
                Err(err)
            }
        }
    }

    /// Clean the interface left over from a previous run
    async fn remove_stale_interface(&self) {
        match self.link.lookup(&self.name).await {
            Ok(Some(_)) => {
                log::info!("Removing stale interface {}", self.name);
                if let Err(e) = self.link.delete(&self.name).await {
                    log::warn!("Failed to remove stale interface {}: {}", self.name, e);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to check for stale interface: {}", e),
        }
    }

    fn start_engine<E: Engine>(&mut self, engine: &E, private_key: &str) -> Result<()> {
        if self.kernel_unavailable {
            return engine
                .start_named(private_key, Adapter::Userspace, &self.name)
                .into_result("starting the engine");
        }

        let status = engine.start_named(private_key, Adapter::Kernel, &self.name);
        if status.is_ok() {
            return Ok(());
        }

        log::warn!(
            "Kernel adapter failed to start ({}), retrying in user space",
            status
        );
        engine
            .start_named(private_key, Adapter::Userspace, &self.name)
            .into_result("starting the engine on retry with the user-space adapter")?;
        self.kernel_unavailable = true;
        Ok(())
    }

    async fn configure<E: Engine>(&self, engine: &E, address: IpAddr) -> Result<TunnelHandle> {
        engine.set_fwmark(self.fwmark).into_result("setting fwmark")?;

        let interface = self
            .link
            .lookup(&self.name)
            .await
            .step("retrieving the interface")?
            .ok_or_else(|| {
                Error::configuration(
                    "retrieving the interface",
                    format!("interface {} was not created", self.name),
                )
            })?;

        self.link
            .add_address(&interface, address)
            .await
            .step("adding addresses to the interface")?;
        self.link
            .set_up(&interface)
            .await
            .step("upping the interface")?;

        let mtu = match self.mtu {
            Some(mtu) => mtu,
            None => tunnel_mtu(self.link.uplink_mtu().await),
        };
        self.link
            .set_mtu(&interface, mtu)
            .await
            .step("setting mtu for the interface")?;

        Ok(TunnelHandle {
            interface,
            addresses: vec![address],
        })
    }

    /// Swap the interface address and key without recreating the interface
    pub async fn update<E: Engine>(
        &mut self,
        engine: &E,
        private_key: &str,
        address: IpAddr,
    ) -> Result<()> {
        let handle = self.handle.as_mut().ok_or(Error::TunnelAbsent)?;

        for old in handle.addresses.clone() {
            self.link
                .remove_address(&handle.interface, old)
                .await
                .step("deleting interface addrs")?;
            handle.addresses.retain(|a| *a != old);
        }

        self.link
            .add_address(&handle.interface, address)
            .await
            .step("adding interface addrs")?;
        handle.addresses.push(address);

        engine
            .set_private_key(private_key)
            .into_result("setting private key")?;

        log::info!(
            "Tunnel {} updated to address {}",
            handle.interface.name,
            address
        );
        Ok(())
    }

    /// Stop the engine's tunnel and forget the interface, if open
    pub fn close<E: Engine>(&mut self, engine: &E) -> Result<()> {
        if self.handle.is_none() {
            return Ok(());
        }
        engine.stop().into_result("stopping the engine")?;
        self.handle = None;
        log::info!("Tunnel {} closed", self.name);
        Ok(())
    }
}
