//! Server configuration.
//! Parsed from a toml file; every field has a default so an empty file (or
//! none at all) yields a working single-subnet setup.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use beekeeper_protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};

/// Scratch directory for job binaries and build output, relative to the
/// working directory on workers and the dispatcher alike.
pub const DEFAULT_SCRATCH_DIR: &str = ".beekeeper";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node name shown to peers. Defaults to the hostname.
    #[serde(default = "default_name")]
    pub name: String,

    /// Shared secret. Frames with a different token are dropped before
    /// dispatch. Empty means no authentication.
    #[serde(default)]
    pub token: String,

    /// Port to accept connections on.
    #[serde(default = "default_port")]
    pub inbound_port: u16,

    /// Port assumed for remote peers when dialling.
    #[serde(default = "default_port")]
    pub outbound_port: u16,

    /// PEM certificate for TLS connections. Generated and cached under
    /// `$HOME/.beekeeper/` when left empty.
    #[serde(skip)]
    pub tls_certificate: Vec<u8>,

    /// PEM private key matching `tls_certificate`.
    #[serde(skip)]
    pub tls_private_key: Vec<u8>,

    /// Accept connections from outside the private address blocks.
    /// Strongly pair with a whitelist and token when enabled.
    #[serde(default)]
    pub allow_external: bool,

    /// Allowed source hosts, IPv4 with `*` per octet. Empty disables the
    /// whitelist.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Wire limit in bytes for a single inbound frame.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Remove build scratch files after a successful distribution.
    #[serde(default = "default_true")]
    pub cleanup: bool,

    /// Run the connection watchdog during distribution and execution.
    #[serde(default = "default_true")]
    pub connection_watchdog: bool,

    /// Log a summary of every frame sent and received.
    #[serde(default)]
    pub debug: bool,

    /// Polling period of both watchdogs, in milliseconds.
    #[serde(default = "default_watchdog_sleep_ms")]
    pub watchdog_sleep_ms: u64,

    /// How long a scan collects status replies, in milliseconds.
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,

    /// Scratch directory for job binaries and build output.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.replace(".local", ""))
        .unwrap_or_default()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_true() -> bool {
    true
}

fn default_watchdog_sleep_ms() -> u64 {
    beekeeper_protocol::DEFAULT_WATCHDOG_SLEEP.as_millis() as u64
}

fn default_scan_window_ms() -> u64 {
    beekeeper_protocol::DEFAULT_SCAN_WINDOW.as_millis() as u64
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SCRATCH_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: default_name(),
            token: String::new(),
            inbound_port: default_port(),
            outbound_port: default_port(),
            tls_certificate: Vec::new(),
            tls_private_key: Vec::new(),
            allow_external: false,
            whitelist: Vec::new(),
            max_frame_size: default_max_frame_size(),
            cleanup: true,
            connection_watchdog: true,
            debug: false,
            watchdog_sleep_ms: default_watchdog_sleep_ms(),
            scan_window_ms: default_scan_window_ms(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

impl Config {
    /// Load config from a toml file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Transport(format!("config parse error: {e}")))
    }

    pub fn watchdog_sleep(&self) -> Duration {
        Duration::from_millis(self.watchdog_sleep_ms)
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    /// Whether an inbound connection from `ip` passes the whitelist.
    /// An empty whitelist admits everyone.
    pub fn whitelist_allows(&self, ip: IpAddr) -> bool {
        if self.whitelist.is_empty() {
            return true;
        }
        let IpAddr::V4(v4) = ip else {
            return false;
        };
        self.whitelist.iter().any(|pattern| matches_pattern(pattern, v4))
    }
}

/// Match an IPv4 address against a dotted pattern where `*` matches any octet.
fn matches_pattern(pattern: &str, ip: Ipv4Addr) -> bool {
    let parts: Vec<&str> = pattern.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts
        .iter()
        .zip(ip.octets().iter())
        .all(|(part, octet)| *part == "*" || part.parse() == Ok(*octet))
}

/// Whether `ip` belongs to a private block: loopback, RFC1918, RFC3927
/// link-local, or the IPv6 loopback/link-local/ULA ranges.
pub fn is_private_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || (segments[0] & 0xffc0) == 0xfe80 // link-local
                || (segments[0] & 0xfe00) == 0xfc00 // unique local
        }
    }
}
