//! NOX VPN server binary.
//!
//! Brings up the gateway TUN interface, starts the TUN pumps and the
//! lease sweeper, then accepts connections forever.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nox_core::config::{load_key, normalize_listen_addr};
use nox_core::server::{tasks, Args, Server, ServerConfig};
use nox_core::tun::{KernelTun, TunConfig};

/// Decrypted packets queued towards the TUN writer.
const TUN_QUEUE: usize = 256;
/// How often expired leases are reaped in the background.
const SWEEP_PERIOD: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let key = load_key(args.key_hex.as_deref(), args.key_file.as_deref())?;
    let listen = normalize_listen_addr(&args.listen);

    let mut config = ServerConfig::new(key, args.subnet);
    config.mtu = args.mtu;
    config.handshake_timeout = Duration::from_secs(args.handshake_timeout_secs);
    config.lease_ttl = Duration::from_secs(args.lease_ttl_secs);
    config.handshake_rps = args.handshake_rps;
    config.handshake_burst = args.handshake_burst;
    config.max_clients = args.max_clients;

    let (tun_tx, tun_rx) = mpsc::channel(TUN_QUEUE);
    let server = Arc::new(Server::new(config, tun_tx));

    let gateway = server.ipam().gateway();
    let tun = KernelTun::create(TunConfig::new(
        &args.tun_name,
        gateway,
        args.subnet.prefix(),
        args.mtu,
    ))
    .await
    .context("creating server TUN device")?;
    info!(name = tun.name(), %gateway, "gateway interface up");
    let (tun_reader, tun_writer) = tun.split();

    tokio::spawn(tasks::tun_writer_task(tun_writer, tun_rx));
    tokio::spawn(tasks::tun_reader_task(tun_reader, server.dispatcher()));
    tokio::spawn(tasks::ipam_sweeper_task(server.ipam(), SWEEP_PERIOD));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(%listen, "NOX server listening");
    tokio::select! {
        r = server.serve(listener) => r,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
