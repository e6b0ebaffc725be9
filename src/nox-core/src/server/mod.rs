//! NOX server: handshake admission, per-connection session engine, and
//! the shared TUN plumbing tasks.
//!
//! Every accepted connection walks the same path: rate-limit check, HELLO
//! within the handshake deadline, lease allocation, ASSIGN, key
//! derivation, then the steady state of two pumps (receive and transmit)
//! until either fails, the peer closes, or the peer goes silent past the
//! heartbeat tolerance. The lease is released and the dispatcher binding
//! removed exactly once per session, whatever the exit path.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use ipnetwork::Ipv4Network;
use nox_crypto::{rng, CipherState, SessionCiphers};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::control::{
    AssignIp, Close, ControlRecord, Heartbeat, Route, ERR_BAD_HELLO, ERR_EXHAUSTED,
    ERR_VERSION_MISMATCH,
};
use crate::dispatcher::Dispatcher;
use crate::frame::{read_record, write_record, Frame, FrameKind, VERSION};
use crate::ipam::{Ipam, IpamError, SessionId};
use crate::ratelimit::TokenBucket;
use crate::replay::ReplayWindow;

/// CLI argument definitions
pub mod args;
/// Long-running server tasks (TUN pumps, lease sweeper)
pub mod tasks;

pub use args::Args;

/// Interval between heartbeats sent to a peer.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
/// A peer is considered dead after this long without any record.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(90);
/// Default bound on the whole handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default MTU offered to clients.
pub const DEFAULT_MTU: u16 = 1400;
/// Default lease lifetime.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);
/// Per-session outbound packet queue depth.
const OUTBOUND_QUEUE: usize = 64;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub key: [u8; 32],
    pub subnet: Ipv4Network,
    pub mtu: u16,
    pub handshake_timeout: Duration,
    pub peer_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub lease_ttl: Duration,
    pub handshake_rps: u32,
    pub handshake_burst: u32,
    pub max_clients: u64,
}

impl ServerConfig {
    /// Defaults for everything but the key and subnet.
    pub fn new(key: [u8; 32], subnet: Ipv4Network) -> Self {
        Self {
            key,
            subnet,
            mtu: DEFAULT_MTU,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            peer_timeout: PEER_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            lease_ttl: DEFAULT_LEASE_TTL,
            handshake_rps: 20,
            handshake_burst: 40,
            max_clients: 256,
        }
    }
}

/// Releases session resources exactly once, on any exit path.
struct SessionGuard {
    ipam: Arc<Ipam>,
    dispatcher: Arc<Dispatcher>,
    session: SessionId,
    ip: Ipv4Addr,
    outbound: mpsc::Sender<Bytes>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.dispatcher.unregister(self.ip, &self.outbound);
        self.ipam.release(&self.session);
    }
}

/// The server: one per process, shared across all connection tasks.
pub struct Server {
    config: ServerConfig,
    ipam: Arc<Ipam>,
    dispatcher: Arc<Dispatcher>,
    limiter: Mutex<TokenBucket>,
    tun_tx: mpsc::Sender<Bytes>,
}

impl Server {
    /// `tun_tx` feeds decrypted client packets to the TUN writer task.
    pub fn new(config: ServerConfig, tun_tx: mpsc::Sender<Bytes>) -> Self {
        let ipam = Arc::new(Ipam::new(config.subnet, config.lease_ttl));
        let limiter = Mutex::new(TokenBucket::new(
            config.handshake_rps,
            config.handshake_burst,
        ));
        Self {
            config,
            ipam,
            dispatcher: Arc::new(Dispatcher::new()),
            limiter,
            tun_tx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn ipam(&self) -> Arc<Ipam> {
        self.ipam.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Accept loop: one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let (usable, active) = self.ipam.stats();
        info!(subnet = %self.config.subnet, usable, active, "server ready");
        loop {
            let (stream, peer) = listener.accept().await.context("accepting connection")?;
            stream.set_nodelay(true).ok();
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!(%peer, error = %e, "session ended");
                }
            });
        }
    }

    /// Drive one connection from handshake to teardown.
    ///
    /// Generic over the stream so tests can exercise the whole path with
    /// in-memory duplex pipes.
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let allowed = {
            let mut limiter = self.limiter.lock().unwrap_or_else(|p| p.into_inner());
            limiter.allow()
        };
        if !allowed {
            // Close without any response.
            debug!("handshake rate-limited, dropping connection");
            return Ok(());
        }

        let frame = match timeout(self.config.handshake_timeout, read_record(&mut stream)).await {
            Err(_) => bail!("handshake timed out"),
            Ok(res) => res.context("reading hello")?,
        };
        if frame.kind != FrameKind::Control {
            bail!("first record was not control");
        }
        let hello = match ControlRecord::decode(&frame.payload) {
            Ok(ControlRecord::Hello(hello)) => hello,
            Ok(other) => bail!("expected hello, got opcode {:#04x}", other.opcode()),
            Err(e) => {
                send_error(&mut stream, ERR_BAD_HELLO, "bad hello").await;
                return Err(e).context("decoding hello");
            }
        };
        if frame.version != VERSION {
            send_error(&mut stream, ERR_VERSION_MISMATCH, "version mismatch").await;
            bail!("unsupported protocol version {:#04x}", frame.version);
        }

        let (lease, is_new) = match self.ipam.allocate(hello.session_id) {
            Ok(grant) => grant,
            Err(IpamError::Exhausted) => {
                send_error(&mut stream, ERR_EXHAUSTED, "no available addresses").await;
                bail!("address pool exhausted");
            }
        };
        debug!(
            session = %hex::encode(hello.session_id),
            ip = %lease.ip,
            is_new,
            "lease granted"
        );

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
        let guard = SessionGuard {
            ipam: self.ipam.clone(),
            dispatcher: self.dispatcher.clone(),
            session: hello.session_id,
            ip: lease.ip,
            outbound: outbound_tx.clone(),
        };

        // Cap check runs after allocation, so a rejected client briefly held
        // a lease; the guard hands it back immediately.
        let (_, active) = self.ipam.stats();
        if self.config.max_clients > 0 && active > self.config.max_clients {
            send_error(&mut stream, ERR_EXHAUSTED, "client limit reached").await;
            bail!("client limit {} reached", self.config.max_clients);
        }

        let mtu = if hello.desired_mtu != 0 {
            self.config.mtu.min(hello.desired_mtu)
        } else {
            self.config.mtu
        };
        let assign = AssignIp {
            session_id: hello.session_id,
            ipv4: lease.ip,
            prefix_len: self.config.subnet.prefix(),
            mtu,
            server_nonce: rng::random_array(),
        };
        write_record(
            &mut stream,
            &Frame::control(ControlRecord::AssignIp(assign).encode()),
        )
        .await
        .context("sending assignment")?;
        write_record(
            &mut stream,
            &Frame::control(
                ControlRecord::Routes(vec![Route {
                    network: self.config.subnet.network(),
                    prefix: self.config.subnet.prefix(),
                }])
                .encode(),
            ),
        )
        .await
        .context("sending routes")?;

        let ciphers = SessionCiphers::derive(
            &self.config.key,
            &hello.session_id,
            &hello.client_nonce,
            &assign.server_nonce,
            true,
        )
        .context("deriving session keys")?;

        self.dispatcher.register(lease.ip, outbound_tx);
        info!(ip = %lease.ip, mtu, "session ready");

        let result = self
            .run_session(stream, ciphers, &hello.session_id, &mut outbound_rx)
            .await;
        drop(guard);
        result
    }

    async fn run_session<S>(
        &self,
        stream: S,
        ciphers: SessionCiphers,
        session: &SessionId,
        outbound: &mut mpsc::Receiver<Bytes>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let SessionCiphers {
            tx: mut cipher_tx,
            rx: cipher_rx,
        } = ciphers;
        let mut replay = ReplayWindow::default();
        let (mut reader, mut writer) = tokio::io::split(stream);

        // Whichever pump finishes first tears the other down by drop.
        tokio::select! {
            r = self.ingress(&mut reader, &cipher_rx, &mut replay, session) => {
                r.context("receive pump")
            }
            r = self.egress(&mut writer, &mut cipher_tx, outbound, session) => {
                r.context("transmit pump")
            }
        }
    }

    /// Receive pump: records from the peer, strictly in order.
    async fn ingress<R>(
        &self,
        reader: &mut R,
        cipher_rx: &CipherState,
        replay: &mut ReplayWindow,
        session: &SessionId,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            let frame = match timeout(self.config.peer_timeout, read_record(reader)).await {
                Err(_) => bail!(
                    "peer silent for {}s, closing",
                    self.config.peer_timeout.as_secs()
                ),
                Ok(res) => res.context("reading record")?,
            };
            match frame.kind {
                FrameKind::Control => match ControlRecord::decode(&frame.payload) {
                    Ok(ControlRecord::Heartbeat(hb)) => {
                        trace!(echo = hb.echo, "heartbeat received");
                        self.ipam.touch(session);
                    }
                    Ok(ControlRecord::Close(close)) => {
                        debug!(code = close.code, reason = %close.reason, "peer closed session");
                        return Ok(());
                    }
                    Ok(ControlRecord::Rekey(_)) => {
                        debug!("peer requested rekey, not supported; ignoring");
                    }
                    Ok(other) => {
                        trace!(opcode = other.opcode(), "ignoring control record");
                    }
                    Err(e) => {
                        // Well-formed-but-unexpected records are tolerated
                        // above; an undecodable one means the peers no
                        // longer agree on the protocol.
                        return Err(e).context("decoding control record");
                    }
                },
                FrameKind::Data => {
                    let Some(packet) = open_data_record(&frame.payload, cipher_rx, replay) else {
                        continue;
                    };
                    if self.tun_tx.send(packet).await.is_err() {
                        bail!("tun writer gone");
                    }
                }
            }
        }
    }

    /// Transmit pump: outbound packets from the dispatcher plus the
    /// heartbeat ticker, serialized onto the write half.
    async fn egress<W>(
        &self,
        writer: &mut W,
        cipher_tx: &mut CipherState,
        outbound: &mut mpsc::Receiver<Bytes>,
        session: &SessionId,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
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
                    self.ipam.touch(session);
                }
                packet = outbound.recv() => {
                    let Some(packet) = packet else {
                        bail!("outbound channel closed");
                    };
                    let record = seal_data_record(cipher_tx, &packet)?;
                    write_record(writer, &record).await.context("sending data record")?;
                }
            }
        }
    }
}

/// Seal one IP packet into a DATA frame: `u64 seq BE || AEAD ciphertext`.
pub(crate) fn seal_data_record(cipher_tx: &mut CipherState, packet: &[u8]) -> Result<Frame> {
    let seq = cipher_tx.seq();
    let ct = cipher_tx.seal(&[], packet).context("sealing packet")?;
    let mut payload = Vec::with_capacity(8 + ct.len());
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(&ct);
    Ok(Frame::data(payload))
}

/// Replay-check and open one DATA payload. Hostile or stale records yield
/// `None` and are dropped without affecting the session.
pub(crate) fn open_data_record(
    payload: &[u8],
    cipher_rx: &CipherState,
    replay: &mut ReplayWindow,
) -> Option<Bytes> {
    if payload.len() < 8 {
        trace!("short data record dropped");
        return None;
    }
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&payload[..8]);
    let seq = u64::from_be_bytes(seq_bytes);
    if !replay.check(seq) {
        trace!(seq, "replayed or stale record dropped");
        return None;
    }
    match cipher_rx.open(seq, &[], &payload[8..]) {
        Ok(packet) => Some(Bytes::from(packet)),
        Err(_) => {
            trace!(seq, "authentication failed, record dropped");
            None
        }
    }
}

async fn send_error<S>(stream: &mut S, code: u16, reason: &str)
where
    S: AsyncWrite + Unpin + Send,
{
    let record = ControlRecord::Error(Close {
        code,
        reason: reason.to_string(),
    });
    // The connection is going away; a failed error send changes nothing.
    let _ = write_record(stream, &Frame::control(record.encode())).await;
}
