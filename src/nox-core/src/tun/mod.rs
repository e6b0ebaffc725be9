//! Packet device abstraction: the kernel TUN driver and an in-memory
//! test double with identical semantics.

use std::future::Future;

use bytes::Bytes;
use thiserror::Error;

/// Kernel TUN device
pub mod device;
/// In-memory paired device for tests
pub mod memory;

pub use device::{KernelTun, KernelTunReader, KernelTunWriter, TunConfig};
pub use memory::{memory_pair, MemoryTun, MemoryTunReader, MemoryTunWriter};

/// Packet device errors.
#[derive(Debug, Error)]
pub enum TunError {
    /// Device closed; reads and writes can never succeed again
    #[error("tun device closed")]
    Closed,

    /// Read deadline elapsed; the device is still usable
    #[error("tun read deadline exceeded")]
    Timeout,

    /// Peer mailbox full; the packet was dropped, the device is usable
    #[error("tun peer backlog full")]
    Backlog,

    /// Device creation or configuration failed
    #[error("tun setup: {0}")]
    Setup(String),

    /// Kernel I/O error
    #[error("tun io: {0}")]
    Io(#[from] std::io::Error),
}

impl TunError {
    /// Whether this error is a read timeout rather than a failure. Pump
    /// loops use this to keep polling instead of tearing the session down.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TunError::Timeout)
    }

    /// Whether the device can still be used after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TunError::Timeout | TunError::Backlog)
    }
}

/// Read side of a packet device: one IP packet per call.
pub trait PacketRead: Send {
    fn read_packet(&mut self) -> impl Future<Output = Result<Bytes, TunError>> + Send;
}

/// Write side of a packet device: one IP packet per call.
pub trait PacketWrite: Send {
    fn write_packet(&mut self, packet: &[u8]) -> impl Future<Output = Result<(), TunError>> + Send;
}
