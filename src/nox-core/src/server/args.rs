//! CLI argument definitions for the NOX server.
//!
//! Every option can also be supplied through its `NOX_*` environment
//! variable; flags win over the environment.

use clap::Parser;
use ipnetwork::Ipv4Network;
use std::path::PathBuf;

/// NOX VPN server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "nox-server", version, about = "NOX point-to-point VPN server")]
pub struct Args {
    /// TCP listen address (`host:port` or `:port`)
    #[arg(long, env = "NOX_LISTEN", default_value = ":9000")]
    pub listen: String,

    /// Client subnet in CIDR notation; `.1` is reserved for the gateway
    #[arg(long, env = "NOX_SUBNET", default_value = "10.8.0.0/24")]
    pub subnet: Ipv4Network,

    /// 32-byte pre-shared key, hex encoded
    #[arg(long, env = "NOX_KEY_HEX")]
    pub key_hex: Option<String>,

    /// File containing the hex-encoded pre-shared key
    #[arg(long, env = "NOX_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// TUN interface name
    #[arg(long, env = "NOX_TUN", default_value = "nox0")]
    pub tun_name: String,

    /// MTU offered to clients
    #[arg(long, default_value = "1400")]
    pub mtu: u16,

    /// Sustained handshake admissions per second
    #[arg(long, env = "NOX_HANDSHAKE_RPS", default_value = "20")]
    pub handshake_rps: u32,

    /// Handshake admission burst headroom
    #[arg(long, env = "NOX_HANDSHAKE_BURST", default_value = "40")]
    pub handshake_burst: u32,

    /// Maximum concurrent clients (0 disables the cap)
    #[arg(long, env = "NOX_MAX_CLIENTS", default_value = "256")]
    pub max_clients: u64,

    /// Handshake deadline in seconds
    #[arg(long, default_value = "5")]
    pub handshake_timeout_secs: u64,

    /// Lease lifetime in seconds
    #[arg(long, default_value = "600")]
    pub lease_ttl_secs: u64,
}
