//! CLI argument definitions for the NOX client.

use clap::Parser;
use ipnetwork::Ipv4Network;
use std::path::PathBuf;

/// NOX VPN client CLI arguments
#[derive(Parser, Debug)]
#[command(name = "nox-client", version, about = "NOX point-to-point VPN client")]
pub struct Args {
    /// Server address (`host:port`)
    #[arg(long, env = "NOX_SERVER")]
    pub server: String,

    /// 32-byte pre-shared key, hex encoded
    #[arg(long, env = "NOX_KEY_HEX")]
    pub key_hex: Option<String>,

    /// File containing the hex-encoded pre-shared key
    #[arg(long, env = "NOX_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Session id as 16 hex chars; random when absent. The session id is
    /// the stickiness handle: reusing it recovers the previous lease.
    #[arg(long, env = "NOX_SESSION_ID")]
    pub session_id: Option<String>,

    /// TUN interface name
    #[arg(long, env = "NOX_TUN", default_value = "nox1")]
    pub tun_name: String,

    /// Desired MTU advertised in the handshake
    #[arg(long, default_value = "1400")]
    pub mtu: u16,

    /// Reconnect with the same session id after a connection drop
    #[arg(
        long,
        env = "NOX_RECONNECT",
        action = clap::ArgAction::Set,
        default_value_t = true
    )]
    pub reconnect: bool,

    /// Fallback address in CIDR form when the server assigns none
    #[arg(long, env = "NOX_CLIENT_CIDR")]
    pub client_cidr: Option<Ipv4Network>,

    /// Handshake deadline in seconds
    #[arg(long, default_value = "5")]
    pub timeout_secs: u64,
}
