//! # NOX Core
//!
//! Point-to-point IPv4 VPN over TCP. A client and server exchange
//! length-prefixed records on a single connection, multiplexing control
//! records (handshake, heartbeats, close) with AEAD-sealed IP packets
//! read from and written to TUN devices.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────┐
//! │           client             │      │           server             │
//! │  ┌─────┐   ┌─────────────┐   │ TCP  │  ┌────────────┐   ┌───────┐  │
//! │  │ TUN │───│ session FSM │───┼──────┼──│ session FSM│───│ IPAM  │  │
//! │  └─────┘   │ seal / open │   │      │  └─────┬──────┘   └───────┘  │
//! │            └─────────────┘   │      │        │ per-lease routing   │
//! │                              │      │  ┌─────┴──────┐   ┌───────┐  │
//! │                              │      │  │ dispatcher │───│  TUN  │  │
//! │                              │      │  └────────────┘   └───────┘  │
//! └──────────────────────────────┘      └──────────────────────────────┘
//! ```
//!
//! Handshake: HELLO → ASSIGN, strictly serialized at the start of each
//! connection. Session keys come from HKDF over the pre-shared master key
//! with both handshake nonces; each direction carries its own key,
//! sequence counter, and replay window.

/// NOX client session engine and binary support
pub mod client;
/// Key material and identifier parsing
pub mod config;
/// Typed control-record codec (HELLO, ASSIGN, ...)
pub mod control;
/// TUN→session routing by destination IPv4
pub mod dispatcher;
/// Length-prefixed record framing
pub mod frame;
/// Sticky session→IPv4 lease allocation
pub mod ipam;
/// IPv4 header peek for routing
pub mod packet;
/// Handshake admission token bucket
pub mod ratelimit;
/// Sliding-bitmap replay detection
pub mod replay;
/// NOX server session engine and tasks
pub mod server;
/// Packet device abstraction (kernel TUN + in-memory pair)
pub mod tun;
