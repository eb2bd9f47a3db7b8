//! Sidecar discovery file (portfile).
//!
//! A running sidecar advertises its endpoint in `.agrafes_sidecar.json`
//! next to the database. The file plus a liveness probe is the
//! coordination primitive for "already running": a second start finds the
//! file, checks that the recorded PID is alive *and* that `GET /health`
//! answers on the recorded endpoint, and only then declines to bind. A
//! file that fails either gate is stale and gets removed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// File name, always placed in the database's directory.
pub const PORTFILE_NAME: &str = ".agrafes_sidecar.json";

/// Contents of the discovery file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfile {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub started_at: String,
    pub db_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Portfile path for a given database path.
pub fn portfile_path(db_path: &Path) -> PathBuf {
    let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(PORTFILE_NAME)
}

/// Reads the discovery file if present. A malformed file reads as absent
/// (it will be overwritten or removed by the caller).
pub fn read(db_path: &Path) -> Option<Portfile> {
    let raw = std::fs::read_to_string(portfile_path(db_path)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Writes the discovery file.
pub fn write(db_path: &Path, portfile: &Portfile) -> Result<()> {
    let path = portfile_path(db_path);
    std::fs::write(&path, serde_json::to_string_pretty(portfile)?)?;
    Ok(())
}

/// Removes the discovery file. Missing files are fine.
pub fn remove(db_path: &Path) {
    let _ = std::fs::remove_file(portfile_path(db_path));
}

/// First gate: is the recorded process alive?
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}", pid)).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        // No cheap portable probe; defer entirely to the health gate.
        let _ = pid;
        true
    }
}

/// Second gate: does `GET /health` answer on the recorded endpoint?
/// Per-request deadline on the order of one second.
pub async fn health_ok(host: &str, port: u16) -> bool {
    let url = format!("http://{}:{}/health", host, port);
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    match client.get(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Both gates. Used by startup to decide between `already_running` and
/// reclaiming a stale file.
pub async fn is_live(portfile: &Portfile) -> bool {
    pid_alive(portfile.pid) && health_ok(&portfile.host, portfile.port).await
}
