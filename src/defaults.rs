use directories::ProjectDirs;
use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

pub const APPLICATION: &str = "pontoon";

pub const CONFIG_FILE: &str = "Pontoon.toml";

fn project_dirs() -> Result<ProjectDirs, anyhow::Error> {
    ProjectDirs::from("", "", APPLICATION)
        .ok_or_else(|| anyhow::anyhow!("Could not open user's home directory"))
}

pub fn config_path() -> Result<PathBuf, anyhow::Error> {
    Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
}

pub const fn address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

pub const fn port() -> u16 {
    9280
}

/// Port a backend address without an explicit port is dialed on.
pub const fn backend_port() -> u16 {
    80
}

pub const fn max_idle_connections() -> usize {
    8
}

/// Failures a backend may accumulate before it is dropped from the fleet.
pub const fn max_allowed_error_count() -> u32 {
    5
}

/// Per-connection ceiling on bytes staged while a backend is interrupted.
pub const fn interrupt_memory_limit_per_conn_bytes() -> usize {
    5 * 1024 * 1024
}

/// Length of time a client or backend gets to finish the opening handshake.
pub const fn handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Chunk size for the pipe copy loops.
pub const COPY_CHUNK_BYTES: usize = 32 * 1024;

/// Cadence of the pool's background fill and refresh tasks.
pub const POOL_TICK: Duration = Duration::from_secs(2);
