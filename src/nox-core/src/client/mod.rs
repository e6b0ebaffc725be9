//! NOX client: dial, handshake, TUN configuration, steady-state pumps,
//! and the reconnect loop.
//!
//! The client sends HELLO with a fresh 16-byte nonce, waits for the
//! address assignment within the handshake deadline, derives session keys
//! for the client role, brings up (or reuses) its TUN device, then runs
//! the same two pumps as the server until the connection dies. With
//! reconnection enabled it retries under the same session id after a
//! short backoff, keeping the TUN device so the host's routes survive the
//! blip.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ipnetwork::Ipv4Network;
use nox_crypto::{rng, CipherState, SessionCiphers};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::control::{
    AssignIp, Close, ControlRecord, Heartbeat, Hello, CAP_MTU_NEG, CAP_REPLAY_GUARD,
};
use crate::frame::{read_record, write_record, Frame, FrameKind};
use crate::ipam::SessionId;
use crate::replay::ReplayWindow;
use crate::server::{open_data_record, seal_data_record, HEARTBEAT_INTERVAL, PEER_TIMEOUT};
use crate::tun::{KernelTun, KernelTunReader, KernelTunWriter, PacketRead, PacketWrite, TunConfig};

/// CLI argument definitions
pub mod args;

pub use args::Args;

/// Pause between reconnect attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
/// Bound on the TCP dial itself.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub key: [u8; 32],
    pub session_id: SessionId,
    pub server_addr: String,
    pub tun_name: String,
    pub mtu: u16,
    pub handshake_timeout: Duration,
    pub peer_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: bool,
    pub reconnect_backoff: Duration,
    /// Address to fall back to when the server assigns none.
    pub fallback_cidr: Option<Ipv4Network>,
}

impl ClientConfig {
    /// Defaults for everything but the key, session id, and server.
    pub fn new(key: [u8; 32], session_id: SessionId, server_addr: impl Into<String>) -> Self {
        Self {
            key,
            session_id,
            server_addr: server_addr.into(),
            tun_name: "nox1".to_string(),
            mtu: 1400,
            handshake_timeout: Duration::from_secs(5),
            peer_timeout: PEER_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect: true,
            reconnect_backoff: RECONNECT_BACKOFF,
            fallback_cidr: None,
        }
    }
}

/// The NOX client.
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Dial, tunnel, and (optionally) keep reconnecting under the same
    /// session id. Returns only on a clean close with reconnection off,
    /// or on a fatal error with reconnection off.
    pub async fn run(&self) -> Result<()> {
        let mut tun: Option<(KernelTunReader, KernelTunWriter, Ipv4Addr)> = None;
        loop {
            match self.connect_once(&mut tun).await {
                Ok(()) => {
                    info!("session closed by server");
                    if !self.config.reconnect {
                        return Ok(());
                    }
                }
                Err(e) => {
                    if !self.config.reconnect {
                        return Err(e);
                    }
                    warn!(error = %e, "session failed");
                }
            }
            debug!(backoff_secs = self.config.reconnect_backoff.as_secs(), "reconnecting");
            sleep(self.config.reconnect_backoff).await;
        }
    }

    async fn connect_once(
        &self,
        tun: &mut Option<(KernelTunReader, KernelTunWriter, Ipv4Addr)>,
    ) -> Result<()> {
        let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&self.config.server_addr)).await
        {
            Err(_) => bail!("dialing {} timed out", self.config.server_addr),
            Ok(res) => res.with_context(|| format!("dialing {}", self.config.server_addr))?,
        };
        stream.set_nodelay(true).ok();
        let mut stream = stream;

        let (assign, client_nonce) = self.handshake(&mut stream).await?;
        let (address, prefix_len) = self.tunnel_address(&assign)?;

        // The TUN device survives reconnects; recreate it only when the
        // lease moved.
        let stale = tun.as_ref().is_some_and(|(_, _, ip)| *ip != address);
        if stale {
            warn!(%address, "assigned address changed, recreating TUN device");
            *tun = None;
        }
        if tun.is_none() {
            let device = KernelTun::create(TunConfig::new(
                &self.config.tun_name,
                address,
                prefix_len,
                assign.mtu,
            ))
            .await
            .context("creating TUN device")?;
            let (reader, writer) = device.split();
            *tun = Some((reader, writer, address));
        }
        let Some((tun_reader, tun_writer, _)) = tun.as_mut() else {
            bail!("TUN device unavailable");
        };

        info!(%address, prefix_len, mtu = assign.mtu, "tunnel established");
        self.run_ready(stream, tun_reader, tun_writer, &assign, &client_nonce)
            .await
    }

    /// Send HELLO and wait for the assignment. Returns the assignment and
    /// the client nonce the keys must be derived with.
    pub async fn handshake<S>(&self, stream: &mut S) -> Result<(AssignIp, [u8; 16])>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let client_nonce: [u8; 16] = rng::random_array();
        let hello = Hello {
            capabilities: CAP_MTU_NEG | CAP_REPLAY_GUARD,
            session_id: self.config.session_id,
            client_nonce,
            desired_mtu: self.config.mtu,
        };
        write_record(stream, &Frame::control(ControlRecord::Hello(hello).encode()))
            .await
            .context("sending hello")?;

        let frame = match timeout(self.config.handshake_timeout, read_record(stream)).await {
            Err(_) => bail!("handshake timed out"),
            Ok(res) => res.context("awaiting assignment")?,
        };
        if frame.kind != FrameKind::Control {
            bail!("expected control record during handshake");
        }
        match ControlRecord::decode(&frame.payload).context("decoding assignment")? {
            ControlRecord::AssignIp(assign) => Ok((assign, client_nonce)),
            ControlRecord::Error(Close { code, reason }) => {
                bail!("server rejected handshake: {code:#06x} {reason}")
            }
            other => bail!("unexpected control record {:#04x}", other.opcode()),
        }
    }

    fn tunnel_address(&self, assign: &AssignIp) -> Result<(Ipv4Addr, u8)> {
        if !assign.ipv4.is_unspecified() {
            return Ok((assign.ipv4, assign.prefix_len));
        }
        match self.config.fallback_cidr {
            Some(cidr) => {
                warn!(%cidr, "server assigned no address, using configured fallback");
                Ok((cidr.ip(), cidr.prefix()))
            }
            None => bail!("server assigned no address and no fallback is configured"),
        }
    }

    /// Steady state: run the two pumps until either fails or the server
    /// closes. Public so tests can drive a session over in-memory pipes
    /// with the in-memory TUN pair.
    pub async fn run_ready<S, R, W>(
        &self,
        stream: S,
        tun_reader: &mut R,
        tun_writer: &mut W,
        assign: &AssignIp,
        client_nonce: &[u8; 16],
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        R: PacketRead,
        W: PacketWrite,
    {
        let SessionCiphers {
            tx: mut cipher_tx,
            rx: cipher_rx,
        } = SessionCiphers::derive(
            &self.config.key,
            &self.config.session_id,
            client_nonce,
            &assign.server_nonce,
            false,
        )
        .context("deriving session keys")?;
        let mut replay = ReplayWindow::default();
        let (mut reader, mut writer) = tokio::io::split(stream);

        tokio::select! {
            r = self.ingress(&mut reader, &cipher_rx, &mut replay, tun_writer) => {
                r.context("receive pump")
            }
            r = self.egress(&mut writer, &mut cipher_tx, tun_reader) => {
                r.context("transmit pump")
            }
        }
    }

    async fn ingress<R, W>(
        &self,
        reader: &mut R,
        cipher_rx: &CipherState,
        replay: &mut ReplayWindow,
        tun_writer: &mut W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: PacketWrite,
    {
        loop {
            let frame = match timeout(self.config.peer_timeout, read_record(reader)).await {
                Err(_) => bail!(
                    "server silent for {}s, closing",
                    self.config.peer_timeout.as_secs()
                ),
                Ok(res) => res.context("reading record")?,
            };
            match frame.kind {
                FrameKind::Control => match ControlRecord::decode(&frame.payload) {
                    Ok(ControlRecord::Heartbeat(hb)) => {
                        trace!(echo = hb.echo, "heartbeat received");
                    }
                    Ok(ControlRecord::Routes(routes)) => {
                        for route in &routes {
                            info!(network = %route.network, prefix = route.prefix, "route pushed by server");
                        }
                    }
                    Ok(ControlRecord::Close(close)) => {
                        debug!(code = close.code, reason = %close.reason, "server closed session");
                        return Ok(());
                    }
                    Ok(ControlRecord::Error(err)) => {
                        bail!("server error {:#06x}: {}", err.code, err.reason);
                    }
                    Ok(ControlRecord::Rekey(_)) => {
                        debug!("server requested rekey, not supported; ignoring");
                    }
                    Ok(other) => {
                        trace!(opcode = other.opcode(), "ignoring control record");
                    }
                    Err(e) => {
                        return Err(e).context("decoding control record");
                    }
                },
                FrameKind::Data => {
                    let Some(packet) = open_data_record(&frame.payload, cipher_rx, replay) else {
                        continue;
                    };
                    if let Err(e) = tun_writer.write_packet(&packet).await {
                        if e.is_fatal() {
                            return Err(e).context("writing packet to TUN");
                        }
                        warn!(error = %e, "TUN write dropped packet");
                    }
                }
            }
        }
    }

    async fn egress<W, R>(
        &self,
        writer: &mut W,
        cipher_tx: &mut CipherState,
        tun_reader: &mut R,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
        R: PacketRead,
    {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut echo: u32 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let record = ControlRecord::Heartbeat(Heartbeat { echo });
                    echo = echo.wrapping_add(1);
                    write_record(writer, &Frame::control(record.encode()))
                        .await
                        .context("sending heartbeat")?;
                }
                packet = tun_reader.read_packet() => {
                    let packet = match packet {
                        Ok(packet) => packet,
                        Err(e) if !e.is_fatal() => continue,
                        Err(e) => return Err(e).context("reading packet from TUN"),
                    };
                    let record = seal_data_record(cipher_tx, &packet)?;
                    write_record(writer, &record).await.context("sending data record")?;
                }
            }
        }
    }
}
