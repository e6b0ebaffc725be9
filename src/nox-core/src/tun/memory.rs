//! In-memory paired packet device.
//!
//! Two paired devices where a write on one side appears on the peer's
//! reads: a bounded mailbox with optional deadline-aware reads. Used by
//! tests to drive full packet flow without kernel devices.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{PacketRead, PacketWrite, TunError};

/// One side of an in-memory device pair.
pub struct MemoryTun {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    read_timeout: Option<Duration>,
}

/// Create a connected pair with the given per-side mailbox capacity.
pub fn memory_pair(capacity: usize) -> (MemoryTun, MemoryTun) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        MemoryTun {
            tx: b_tx,
            rx: a_rx,
            read_timeout: None,
        },
        MemoryTun {
            tx: a_tx,
            rx: b_rx,
            read_timeout: None,
        },
    )
}

impl MemoryTun {
    /// Bound every subsequent read; `None` blocks indefinitely.
    pub fn set_read_timeout(&mut self, limit: Option<Duration>) {
        self.read_timeout = limit;
    }

    /// Split into independently owned read and write halves. The read
    /// timeout carries over to the read half.
    pub fn split(self) -> (MemoryTunReader, MemoryTunWriter) {
        (
            MemoryTunReader {
                rx: self.rx,
                read_timeout: self.read_timeout,
            },
            MemoryTunWriter { tx: self.tx },
        )
    }
}

async fn recv_packet(
    rx: &mut mpsc::Receiver<Bytes>,
    limit: Option<Duration>,
) -> Result<Bytes, TunError> {
    let packet = match limit {
        Some(limit) => timeout(limit, rx.recv()).await.map_err(|_| TunError::Timeout)?,
        None => rx.recv().await,
    };
    packet.ok_or(TunError::Closed)
}

fn send_packet(tx: &mpsc::Sender<Bytes>, packet: &[u8]) -> Result<(), TunError> {
    match tx.try_send(Bytes::copy_from_slice(packet)) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(TunError::Backlog),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(TunError::Closed),
    }
}

impl PacketRead for MemoryTun {
    async fn read_packet(&mut self) -> Result<Bytes, TunError> {
        recv_packet(&mut self.rx, self.read_timeout).await
    }
}

impl PacketWrite for MemoryTun {
    async fn write_packet(&mut self, packet: &[u8]) -> Result<(), TunError> {
        send_packet(&self.tx, packet)
    }
}

/// Read half of an in-memory device.
pub struct MemoryTunReader {
    rx: mpsc::Receiver<Bytes>,
    read_timeout: Option<Duration>,
}

impl MemoryTunReader {
    pub fn set_read_timeout(&mut self, limit: Option<Duration>) {
        self.read_timeout = limit;
    }
}

impl PacketRead for MemoryTunReader {
    async fn read_packet(&mut self) -> Result<Bytes, TunError> {
        recv_packet(&mut self.rx, self.read_timeout).await
    }
}

/// Write half of an in-memory device.
#[derive(Clone)]
pub struct MemoryTunWriter {
    tx: mpsc::Sender<Bytes>,
}

impl PacketWrite for MemoryTunWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> Result<(), TunError> {
        send_packet(&self.tx, packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_appears_on_peer_read() {
        let (mut a, mut b) = memory_pair(8);
        a.write_packet(b"ping").await.unwrap();
        assert_eq!(b.read_packet().await.unwrap(), Bytes::from_static(b"ping"));

        b.write_packet(b"pong").await.unwrap();
        assert_eq!(a.read_packet().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn read_timeout_is_reported_as_timeout() {
        let (mut a, _b) = memory_pair(8);
        a.set_read_timeout(Some(Duration::from_millis(20)));
        let err = a.read_packet().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn overflow_is_non_fatal() {
        let (mut a, mut b) = memory_pair(2);
        a.write_packet(b"1").await.unwrap();
        a.write_packet(b"2").await.unwrap();
        let err = a.write_packet(b"3").await.unwrap_err();
        assert!(matches!(err, TunError::Backlog));
        assert!(!err.is_fatal());

        // Draining the mailbox makes room again.
        assert_eq!(b.read_packet().await.unwrap(), Bytes::from_static(b"1"));
        a.write_packet(b"3").await.unwrap();
    }

    #[tokio::test]
    async fn dropped_peer_closes_device() {
        let (mut a, b) = memory_pair(2);
        drop(b);
        let err = a.write_packet(b"pkt").await.unwrap_err();
        assert!(matches!(err, TunError::Closed));
        assert!(err.is_fatal());

        let err = a.read_packet().await.unwrap_err();
        assert!(matches!(err, TunError::Closed));
    }

    #[tokio::test]
    async fn split_halves_stay_paired() {
        let (a, mut b) = memory_pair(4);
        let (mut a_read, mut a_write) = a.split();

        a_write.write_packet(b"out").await.unwrap();
        assert_eq!(b.read_packet().await.unwrap(), Bytes::from_static(b"out"));

        b.write_packet(b"in").await.unwrap();
        assert_eq!(a_read.read_packet().await.unwrap(), Bytes::from_static(b"in"));
    }

    #[tokio::test]
    async fn read_after_timeout_still_works() {
        let (mut a, mut b) = memory_pair(4);
        a.set_read_timeout(Some(Duration::from_millis(10)));
        assert!(a.read_packet().await.unwrap_err().is_timeout());
        b.write_packet(b"late").await.unwrap();
        assert_eq!(a.read_packet().await.unwrap(), Bytes::from_static(b"late"));
    }
}
