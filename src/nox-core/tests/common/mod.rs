//! Shared helpers for integration tests: shortened timers, a scripted
//! client half, and packet builders.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use nox_crypto::{CipherState, SessionCiphers};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;

use nox_core::client::ClientConfig;
use nox_core::control::{
    AssignIp, Close, ControlRecord, Hello, CAP_MTU_NEG, CAP_REPLAY_GUARD,
};
use nox_core::frame::{read_record, write_record, Frame, FrameKind};
use nox_core::ipam::SessionId;
use nox_core::server::ServerConfig;

pub const MASTER_KEY: [u8; 32] = [0u8; 32];
pub const SESSION: SessionId = [1, 2, 3, 4, 5, 6, 7, 8];
pub const CLIENT_NONCE: [u8; 16] = [0xAA; 16];

/// Server configuration with timers shortened for tests.
pub fn server_config(subnet: &str) -> ServerConfig {
    let mut config = ServerConfig::new(MASTER_KEY, subnet.parse().unwrap());
    config.handshake_timeout = Duration::from_millis(500);
    config.peer_timeout = Duration::from_secs(2);
    config.heartbeat_interval = Duration::from_millis(200);
    config
}

/// Client configuration with timers shortened for tests.
pub fn client_config(session_id: SessionId) -> ClientConfig {
    let mut config = ClientConfig::new(MASTER_KEY, session_id, "test:0");
    config.handshake_timeout = Duration::from_millis(500);
    config.peer_timeout = Duration::from_secs(2);
    config.heartbeat_interval = Duration::from_millis(200);
    config.reconnect = false;
    config
}

/// Send a HELLO with the fixed test nonce.
pub async fn send_hello<S>(stream: &mut S, session_id: SessionId, desired_mtu: u16)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let hello = Hello {
        capabilities: CAP_MTU_NEG | CAP_REPLAY_GUARD,
        session_id,
        client_nonce: CLIENT_NONCE,
        desired_mtu,
    };
    write_record(stream, &Frame::control(ControlRecord::Hello(hello).encode()))
        .await
        .expect("test: sending hello");
}

/// Read one control record, failing the test on data frames.
pub async fn read_control<S>(stream: &mut S) -> ControlRecord
where
    S: AsyncRead + Unpin + Send,
{
    let frame = timeout(Duration::from_secs(2), read_record(stream))
        .await
        .expect("test: control record timed out")
        .expect("test: reading control record");
    assert_eq!(frame.kind, FrameKind::Control);
    ControlRecord::decode(&frame.payload).expect("test: decoding control record")
}

/// Complete a scripted handshake: HELLO then the assignment (or the error
/// the server answered with instead).
pub async fn client_handshake<S>(
    stream: &mut S,
    session_id: SessionId,
    desired_mtu: u16,
) -> Result<AssignIp, Close>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    send_hello(stream, session_id, desired_mtu).await;
    match read_control(stream).await {
        ControlRecord::AssignIp(assign) => Ok(assign),
        ControlRecord::Error(err) => Err(err),
        other => panic!("unexpected handshake response: {other:?}"),
    }
}

/// Session ciphers for the scripted client role.
pub fn client_ciphers(assign: &AssignIp, session_id: &SessionId) -> SessionCiphers {
    SessionCiphers::derive(
        &MASTER_KEY,
        session_id,
        &CLIENT_NONCE,
        &assign.server_nonce,
        false,
    )
    .expect("test: deriving ciphers")
}

/// Seal one packet into a DATA frame the way a peer would.
pub fn seal_data(cipher_tx: &mut CipherState, packet: &[u8]) -> Frame {
    let seq = cipher_tx.seq();
    let ct = cipher_tx.seal(&[], packet).expect("test: sealing");
    let mut payload = Vec::with_capacity(8 + ct.len());
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(&ct);
    Frame::data(payload)
}

/// Read frames until the first DATA frame, skipping control records.
pub async fn read_data<S>(stream: &mut S) -> Frame
where
    S: AsyncRead + Unpin + Send,
{
    loop {
        let frame = timeout(Duration::from_secs(2), read_record(stream))
            .await
            .expect("test: data record timed out")
            .expect("test: reading data record");
        if frame.kind == FrameKind::Data {
            return frame;
        }
    }
}

/// Minimal IPv4 packet with the given addresses and payload.
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64; // ttl
    pkt[9] = 17; // udp
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());
    pkt[20..].copy_from_slice(payload);
    pkt
}

/// Expect a packet on the channel within the deadline.
pub async fn expect_packet(rx: &mut mpsc::Receiver<Bytes>, what: &str) -> Bytes {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("test: timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("test: channel closed waiting for {what}"))
}

/// Assert that nothing arrives on the channel for the given window.
pub async fn expect_silence(rx: &mut mpsc::Receiver<Bytes>, window: Duration, what: &str) {
    if let Ok(Some(pkt)) = timeout(window, rx.recv()).await {
        panic!("test: unexpected {what}: {pkt:?}");
    }
}
