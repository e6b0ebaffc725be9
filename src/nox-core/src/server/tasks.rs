//! Long-running server tasks: TUN pumps and the lease sweeper.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::Dispatcher;
use crate::ipam::Ipam;
use crate::packet::ipv4_destination;
use crate::tun::{PacketRead, PacketWrite};

/// Drain decrypted client packets onto the TUN device.
pub async fn tun_writer_task<W: PacketWrite>(mut writer: W, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(packet) = rx.recv().await {
        if let Err(e) = writer.write_packet(&packet).await {
            if e.is_fatal() {
                error!(error = %e, "TUN write error");
                break;
            }
            warn!(error = %e, "TUN write dropped packet");
        }
    }
    debug!("TUN writer task ended");
}

/// Read the TUN and route each packet to the owning session by its IPv4
/// destination. Non-IPv4 and unroutable packets are dropped.
pub async fn tun_reader_task<R: PacketRead>(mut reader: R, dispatcher: Arc<Dispatcher>) {
    loop {
        match reader.read_packet().await {
            Ok(packet) => match ipv4_destination(&packet) {
                Some(dst) => {
                    dispatcher.dispatch(dst, packet);
                }
                None => {
                    trace!(len = packet.len(), "non-IPv4 packet from TUN dropped");
                }
            },
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                error!(error = %e, "TUN read error");
                break;
            }
        }
    }
    debug!("TUN reader task ended");
}

/// Periodically reap expired leases.
pub async fn ipam_sweeper_task(ipam: Arc<Ipam>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // the immediate first tick
    loop {
        ticker.tick().await;
        let reaped = ipam.sweep();
        if reaped > 0 {
            let (usable, active) = ipam.stats();
            info!(reaped, usable, active, "reaped idle leases");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::memory_pair;
    use std::net::Ipv4Addr;

    fn ipv4_packet(dst: Ipv4Addr) -> Bytes {
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&20u16.to_be_bytes());
        pkt[16..20].copy_from_slice(&dst.octets());
        Bytes::from(pkt)
    }

    #[tokio::test]
    async fn writer_task_moves_packets_to_device() {
        let (host_side, mut peer) = memory_pair(8);
        let (_, writer) = host_side.split();
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(tun_writer_task(writer, rx));
        tx.send(Bytes::from_static(b"\x45packet")).await.unwrap();
        assert_eq!(
            peer.read_packet().await.unwrap(),
            Bytes::from_static(b"\x45packet")
        );
        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reader_task_routes_by_destination() {
        let (host_side, mut peer) = memory_pair(8);
        let (reader, _writer) = host_side.split();
        let dispatcher = Arc::new(Dispatcher::new());
        let dst = Ipv4Addr::new(10, 8, 0, 2);
        let (session_tx, mut session_rx) = mpsc::channel(8);
        dispatcher.register(dst, session_tx);

        let task = tokio::spawn(tun_reader_task(reader, dispatcher));
        let pkt = ipv4_packet(dst);
        peer.write_packet(&pkt).await.unwrap();
        assert_eq!(session_rx.recv().await.unwrap(), pkt);

        // Unknown destination and garbage are both dropped silently.
        peer.write_packet(&ipv4_packet(Ipv4Addr::new(10, 8, 0, 77)))
            .await
            .unwrap();
        peer.write_packet(b"junk").await.unwrap();
        drop(peer);
        task.await.unwrap();
        assert!(session_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweeper_reaps_released_leases() {
        let ipam = Arc::new(Ipam::new(
            "10.8.0.0/24".parse().unwrap(),
            Duration::from_secs(600),
        ));
        ipam.allocate([1; 8]).unwrap();
        ipam.release(&[1; 8]);

        tokio::spawn(ipam_sweeper_task(ipam.clone(), Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        // The background sweeper already removed the tombstone, so a manual
        // sweep finds nothing left to reap.
        assert_eq!(ipam.sweep(), 0);
        let (_, active) = ipam.stats();
        assert_eq!(active, 0);
    }
}
