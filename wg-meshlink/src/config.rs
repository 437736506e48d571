// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading TOML configuration files and validating
//! their contents: interface names, key material, timeouts and routing.

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use wireguard_control::Key;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Upper bound for `general.connect_timeout` (seconds)
const MAX_CONNECT_TIMEOUT_SECS: u64 = 3600;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
    parse_config(&contents)
}

/// Parse and validate configuration from TOML text
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    validate_interface_name(&config.general.interface)?;

    if !(1..=MAX_CONNECT_TIMEOUT_SECS).contains(&config.general.connect_timeout) {
        anyhow::bail!(
            "connect_timeout must be between 1 and {} seconds, got {}",
            MAX_CONNECT_TIMEOUT_SECS,
            config.general.connect_timeout
        );
    }

    if let Some(mtu) = config.general.mtu {
        if !(576..=9000).contains(&mtu) {
            anyhow::bail!("mtu must be between 576 and 9000, got {}", mtu);
        }
    }

    validate_key(&config.vpn.private_key).context("Invalid vpn.private_key")?;
    validate_key(&config.vpn.server_public_key).context("Invalid vpn.server_public_key")?;

    if let Some(mesh) = &config.mesh {
        validate_key(&mesh.private_key).context("Invalid mesh.private_key")?;
        if mesh.address.is_unspecified() {
            anyhow::bail!("mesh.address cannot be unspecified");
        }
    }

    if config.routing.table_id == 0 {
        anyhow::bail!("routing.table_id must be > 0");
    }

    // The suppress rule is installed one priority below the policy rule
    if config.routing.priority == 0 {
        anyhow::bail!("routing.priority must be > 0");
    }

    Ok(())
}

/// Validates that an interface name is safe for use in shell commands and system calls.
/// Only alphanumeric characters, hyphens, and underscores are allowed.
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("Interface name cannot be empty");
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        anyhow::bail!(
            "Interface name '{}' is longer than {} characters",
            name,
            MAX_INTERFACE_NAME_LEN
        );
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "Interface name contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            name
        );
    }

    Ok(())
}

/// Check that a key is 32 bytes of base64
pub fn validate_key(key: &str) -> Result<()> {
    Key::from_base64(key)
        .map(|_| ())
        .map_err(|_| anyhow::anyhow!("expected a base64 encoded 32 byte key"))
}
