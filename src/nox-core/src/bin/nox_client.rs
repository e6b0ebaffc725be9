//! NOX VPN client binary.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nox_core::client::{Args, Client, ClientConfig};
use nox_core::config::{load_key, parse_session_id, random_session_id};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let key = load_key(args.key_hex.as_deref(), args.key_file.as_deref())?;
    let session_id = match args.session_id.as_deref() {
        Some(s) => parse_session_id(s)?,
        None => random_session_id(),
    };

    let mut config = ClientConfig::new(key, session_id, args.server.clone());
    config.tun_name = args.tun_name;
    config.mtu = args.mtu;
    config.handshake_timeout = Duration::from_secs(args.timeout_secs);
    config.reconnect = args.reconnect;
    config.fallback_cidr = args.client_cidr;

    info!(
        server = %args.server,
        session = %hex::encode(session_id),
        "connecting"
    );
    let client = Client::new(config);
    tokio::select! {
        r = client.run() => r,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
