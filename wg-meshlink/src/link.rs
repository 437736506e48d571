// OS network interface operations

//! OS network interface operations
//!
//! [`LinkOps`] is the set of interface operations the tunnel manager needs.
//! [`IpCommand`] implements it on Linux with `ip(8)` and sysfs.

use crate::error::{Error, Result};
use crate::types::Interface;
use std::future::Future;
use std::net::IpAddr;
use tokio::process::Command;

/// Network interface operations used while managing the tunnel
pub trait LinkOps: Send + Sync {
    /// Resolve an interface by name, `None` if it does not exist
    fn lookup(&self, name: &str) -> impl Future<Output = Result<Option<Interface>>> + Send;

    /// Delete the interface
    fn delete(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    /// Assign `addr` as a host address
    fn add_address(
        &self,
        iface: &Interface,
        addr: IpAddr,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove a host address
    fn remove_address(
        &self,
        iface: &Interface,
        addr: IpAddr,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Bring the interface up
    fn set_up(&self, iface: &Interface) -> impl Future<Output = Result<()>> + Send;

    /// Set the interface MTU
    fn set_mtu(&self, iface: &Interface, mtu: u32) -> impl Future<Output = Result<()>> + Send;

    /// MTU of the interface carrying the default route, if it can be found
    fn uplink_mtu(&self) -> impl Future<Output = Option<u32>> + Send;
}

/// Host prefix for a single address
fn host_cidr(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(_) => format!("{}/32", addr),
        IpAddr::V6(_) => format!("{}/128", addr),
    }
}

/// Extract the device name from `ip route show default` output
/// Format: "default via 192.168.1.1 dev eth0 proto dhcp metric 100"
#[doc(hidden)]
pub fn parse_default_route_device(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.find(" dev ")
            .and_then(|pos| line[pos + 5..].split_whitespace().next())
            .map(str::to_string)
    })
}

/// [`LinkOps`] backed by `ip(8)` and `/sys/class/net`
#[derive(Debug, Default, Clone)]
pub struct IpCommand;

impl IpCommand {
    /// Create the command runner
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, step: &'static str, args: &[&str]) -> Result<String> {
        log::debug!("ip {}", args.join(" "));

        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::configuration(step, format!("failed to execute ip: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::configuration(step, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn read_sysfs(name: &str, attribute: &str) -> Option<String> {
        let path = format!("/sys/class/net/{}/{}", name, attribute);
        tokio::fs::read_to_string(path)
            .await
            .ok()
            .map(|value| value.trim().to_string())
    }
}

impl LinkOps for IpCommand {
    async fn lookup(&self, name: &str) -> Result<Option<Interface>> {
        if crate::config::validate_interface_name(name).is_err() {
            return Err(Error::configuration(
                "resolving the interface",
                format!("invalid interface name '{}'", name),
            ));
        }

        let Some(index) = Self::read_sysfs(name, "ifindex").await else {
            return Ok(None);
        };
        let index = index.parse::<u32>().map_err(|e| {
            Error::configuration("resolving the interface", format!("bad ifindex: {}", e))
        })?;

        Ok(Some(Interface {
            name: name.to_string(),
            index,
        }))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.run("deleting the interface", &["link", "del", name])
            .await
            .map(|_| ())
    }

    async fn add_address(&self, iface: &Interface, addr: IpAddr) -> Result<()> {
        let cidr = host_cidr(addr);
        self.run(
            "adding an address to the interface",
            &["addr", "add", &cidr, "dev", &iface.name],
        )
        .await?;
        log::info!("Address {} added to {}", cidr, iface.name);
        Ok(())
    }

    async fn remove_address(&self, iface: &Interface, addr: IpAddr) -> Result<()> {
        let cidr = host_cidr(addr);
        self.run(
            "removing an address from the interface",
            &["addr", "del", &cidr, "dev", &iface.name],
        )
        .await?;
        log::info!("Address {} removed from {}", cidr, iface.name);
        Ok(())
    }

    async fn set_up(&self, iface: &Interface) -> Result<()> {
        self.run(
            "bringing the interface up",
            &["link", "set", "dev", &iface.name, "up"],
        )
        .await
        .map(|_| ())
    }

    async fn set_mtu(&self, iface: &Interface, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.run(
            "setting the interface mtu",
            &["link", "set", "dev", &iface.name, "mtu", &mtu],
        )
        .await
        .map(|_| ())
    }

    async fn uplink_mtu(&self) -> Option<u32> {
        let routes = self
            .run("finding the default route", &["route", "show", "default"])
            .await
            .ok()?;
        let device = parse_default_route_device(&routes)?;
        Self::read_sysfs(&device, "mtu").await?.parse().ok()
    }
}
