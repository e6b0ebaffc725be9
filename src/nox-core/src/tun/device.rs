//! Kernel TUN device with async I/O.
//!
//! Opens the host TUN driver in pure-IP mode (no packet-info header) with
//! the requested interface name, address, and MTU. Creation races with a
//! leftover interface from a previous run are handled by deleting the
//! link by name and retrying once.

use std::net::Ipv4Addr;
use std::process::Command;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_tun::{Tun, TunBuilder};
use tracing::{info, warn};

use super::{PacketRead, PacketWrite, TunError};

/// Configuration for a kernel TUN interface.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Interface name (e.g. `nox0`)
    pub name: String,
    /// Local address of the interface
    pub address: Ipv4Addr,
    /// Netmask derived from the prefix length
    pub netmask: Ipv4Addr,
    /// MTU
    pub mtu: u16,
}

impl TunConfig {
    pub fn new(name: impl Into<String>, address: Ipv4Addr, prefix_len: u8, mtu: u16) -> Self {
        Self {
            name: name.into(),
            address,
            netmask: prefix_to_netmask(prefix_len),
            mtu,
        }
    }
}

/// Convert a prefix length to a dotted netmask.
pub fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    };
    Ipv4Addr::from(bits)
}

/// An opened kernel TUN interface.
pub struct KernelTun {
    name: String,
    tun: Tun,
    mtu: u16,
}

impl KernelTun {
    /// Create and bring up the interface. If the driver reports the device
    /// as busy, the stale link is deleted and creation retried once.
    pub async fn create(config: TunConfig) -> Result<Self, TunError> {
        let tun = match Self::build(&config) {
            Ok(tun) => tun,
            Err(e) if e.to_string().to_lowercase().contains("busy") => {
                warn!(name = %config.name, "TUN device busy, cleaning up stale link");
                delete_link(&config.name);
                Self::build(&config)?
            }
            Err(e) => return Err(e),
        };
        let name = tun.name().to_string();
        info!(
            name = %name,
            address = %config.address,
            netmask = %config.netmask,
            mtu = config.mtu,
            "TUN device created and configured"
        );
        Ok(Self {
            name,
            tun,
            mtu: config.mtu,
        })
    }

    fn build(config: &TunConfig) -> Result<Tun, TunError> {
        TunBuilder::new()
            .name(&config.name)
            .address(config.address)
            .netmask(config.netmask)
            .mtu(i32::from(config.mtu))
            .up()
            .try_build()
            .map_err(|e| TunError::Setup(e.to_string()))
    }

    /// Interface name as assigned by the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (KernelTunReader, KernelTunWriter) {
        let (read, write) = tokio::io::split(self.tun);
        (
            KernelTunReader {
                inner: read,
                mtu: self.mtu,
            },
            KernelTunWriter { inner: write },
        )
    }
}

/// Delete a leftover interface by name. Failure is fine: the interface
/// may simply not exist.
fn delete_link(name: &str) {
    let _ = Command::new("ip").args(["link", "del", name]).status();
}

/// Read half of a kernel TUN device.
pub struct KernelTunReader {
    inner: ReadHalf<Tun>,
    mtu: u16,
}

impl PacketRead for KernelTunReader {
    async fn read_packet(&mut self) -> Result<Bytes, TunError> {
        let mut buf = vec![0u8; usize::from(self.mtu) + 4];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            return Err(TunError::Closed);
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

/// Write half of a kernel TUN device.
pub struct KernelTunWriter {
    inner: WriteHalf<Tun>,
}

impl PacketWrite for KernelTunWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> Result<(), TunError> {
        self.inner.write_all(packet).await?;
        Ok(())
    }
}
