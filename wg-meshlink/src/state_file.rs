// State file writer for external monitoring

//! State file writer
//!
//! Writes the current connection state to a file for consumption by status
//! bars and scripts.

use crate::types::ConnectionState;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

const STATE_FILE: &str = "/run/wg-meshlink/state";
const STATE_DIR: &str = "/run/wg-meshlink";

/// Render the state file contents
fn render(state: &ConnectionState, interface: Option<&str>, timestamp: u64) -> String {
    let vpn = if state.active { "connected" } else { "exited" };
    let mesh = if state.mesh_enabled { "on" } else { "off" };
    format!(
        "STATE={}\nMESH={}\nINTERFACE={}\nTIMESTAMP={}\n",
        vpn,
        mesh,
        interface.unwrap_or(""),
        timestamp
    )
}

/// Write current state to state file
pub fn write_state(state: &ConnectionState, interface: Option<&str>) -> Result<()> {
    let state_dir = Path::new(STATE_DIR);
    if !state_dir.exists() {
        fs::create_dir_all(state_dir).context("Failed to create state directory")?;
    }

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    fs::write(STATE_FILE, render(state, interface, timestamp))
        .context("Failed to write state file")?;

    Ok(())
}

/// Remove state file on shutdown
pub fn cleanup() {
    let _ = fs::remove_file(STATE_FILE);
}
