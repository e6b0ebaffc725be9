//! Sticky session→IPv4 lease allocation with TTL reaping.
//!
//! One manager per server process. A session that reconnects before its
//! lease expires recovers the same address; expired leases are swept on
//! every allocation and by the background sweeper. The network address,
//! the broadcast address, and the first host (the server gateway) are
//! never handed out.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ipnetwork::Ipv4Network;
use thiserror::Error;

/// Session identifier used as the stickiness handle.
pub type SessionId = [u8; 8];

/// Allocation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpamError {
    #[error("no available addresses")]
    Exhausted,
}

/// The binding of a session to an address with an expiration time.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub session: SessionId,
    pub acquired: Instant,
    pub expires: Instant,
}

struct Inner {
    /// Next address to try, kept one past the last grant to spread leases.
    next_hint: u32,
    leases: HashMap<SessionId, Lease>,
}

/// Sticky IPv4 lease manager.
pub struct Ipam {
    subnet: Ipv4Network,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl Ipam {
    pub fn new(subnet: Ipv4Network, ttl: Duration) -> Self {
        let base = u32::from(subnet.network());
        Self {
            subnet,
            ttl,
            inner: Mutex::new(Inner {
                next_hint: base + 1,
                leases: HashMap::new(),
            }),
        }
    }

    /// Subnet this manager allocates from.
    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    /// Gateway address reserved for the server (`.1` of the subnet).
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()) + 1)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves consistent lease data;
        // recover rather than propagate the poison.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn host_count(&self) -> u64 {
        1u64 << (32 - u32::from(self.subnet.prefix()))
    }

    fn usable(&self) -> u64 {
        self.host_count().saturating_sub(2)
    }

    /// Allocate an address for `session`, or refresh its live lease.
    ///
    /// Returns the lease and whether it is newly created.
    pub fn allocate(&self, session: SessionId) -> Result<(Lease, bool), IpamError> {
        let mut inner = self.lock();
        let now = Instant::now();

        // Sticky reuse: any lease entry still present (even a tombstone that
        // no sweep has reaped yet) is refreshed in place. Uniqueness holds
        // because the expired-lease sweep below runs before every fresh
        // grant, so a tombstoned address is either still owned by its
        // session or already gone from the table.
        if let Some(lease) = inner.leases.get_mut(&session) {
            lease.expires = now + self.ttl;
            return Ok((lease.clone(), false));
        }

        inner.leases.retain(|_, lease| lease.expires > now);

        let usable = self.usable();
        if usable == 0 {
            return Err(IpamError::Exhausted);
        }

        let base = u32::from(self.subnet.network());
        let gateway = base + 1;
        let start = u64::from(inner.next_hint - base - 1);
        for i in 0..usable {
            let offset = (start + i) % usable;
            let cand = base + offset as u32 + 1;
            if cand == gateway {
                continue;
            }
            let ip = Ipv4Addr::from(cand);
            if inner.leases.values().any(|l| l.ip == ip) {
                continue;
            }
            let lease = Lease {
                ip,
                session,
                acquired: now,
                expires: now + self.ttl,
            };
            inner.leases.insert(session, lease.clone());
            inner.next_hint = base + ((offset + 1) % usable) as u32 + 1;
            return Ok((lease, true));
        }
        Err(IpamError::Exhausted)
    }

    /// Tombstone the session's lease; the address becomes immediately
    /// available to other sessions.
    pub fn release(&self, session: &SessionId) {
        let mut inner = self.lock();
        let now = Instant::now();
        if let Some(lease) = inner.leases.get_mut(session) {
            lease.expires = now;
        }
    }

    /// Refresh the expiry of a live lease.
    pub fn touch(&self, session: &SessionId) {
        let mut inner = self.lock();
        let now = Instant::now();
        if let Some(lease) = inner.leases.get_mut(session) {
            if lease.expires > now {
                lease.expires = now + self.ttl;
            }
        }
    }

    /// Remove every expired lease; returns how many were reaped.
    pub fn sweep(&self) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();
        let before = inner.leases.len();
        inner.leases.retain(|_, lease| lease.expires > now);
        before - inner.leases.len()
    }

    /// `(total usable, active)` address counts.
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.lock();
        let now = Instant::now();
        let active = inner
            .leases
            .values()
            .filter(|lease| lease.expires > now)
            .count() as u64;
        (self.usable(), active)
    }

    #[cfg(test)]
    fn set_next_hint(&self, ip: Ipv4Addr) {
        self.lock().next_hint = u32::from(ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn mgr(subnet: &str) -> Ipam {
        Ipam::new(net(subnet), Duration::from_secs(600))
    }

    fn sid(b: u8) -> SessionId {
        [b; 8]
    }

    #[test]
    fn first_lease_skips_gateway() {
        let ipam = mgr("10.8.0.0/24");
        let (lease, is_new) = ipam.allocate(sid(1)).unwrap();
        assert!(is_new);
        assert_eq!(lease.ip, Ipv4Addr::new(10, 8, 0, 2));
    }

    #[test]
    fn sticky_reuse_within_ttl() {
        let ipam = mgr("10.8.0.0/24");
        let (first, _) = ipam.allocate(sid(1)).unwrap();
        let (second, is_new) = ipam.allocate(sid(1)).unwrap();
        assert!(!is_new);
        assert_eq!(first.ip, second.ip);
    }

    #[test]
    fn leases_are_unique() {
        let ipam = mgr("10.8.0.0/24");
        let mut seen = std::collections::HashSet::new();
        for b in 0..50 {
            let (lease, _) = ipam.allocate(sid(b)).unwrap();
            assert!(seen.insert(lease.ip), "duplicate lease {}", lease.ip);
        }
    }

    #[test]
    fn release_frees_for_other_sessions() {
        let ipam = mgr("10.8.0.0/30");
        let (lease, _) = ipam.allocate(sid(1)).unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(10, 8, 0, 2));
        ipam.release(&sid(1));
        let (other, is_new) = ipam.allocate(sid(2)).unwrap();
        assert!(is_new);
        assert_eq!(other.ip, lease.ip);
    }

    #[test]
    fn reconnect_after_release_recovers_address() {
        // A disconnect releases the lease, but the reconnecting session
        // still recovers its address until a sweep reaps the tombstone.
        let ipam = mgr("10.8.0.0/24");
        let (first, _) = ipam.allocate(sid(1)).unwrap();
        ipam.release(&sid(1));
        let (again, is_new) = ipam.allocate(sid(1)).unwrap();
        assert!(!is_new);
        assert_eq!(again.ip, first.ip);
        let (_, active) = ipam.stats();
        assert_eq!(active, 1);
    }

    #[test]
    fn swept_tombstone_breaks_stickiness() {
        let ipam = mgr("10.8.0.0/24");
        let (first, _) = ipam.allocate(sid(1)).unwrap();
        ipam.release(&sid(1));
        assert_eq!(ipam.sweep(), 1);
        let (again, is_new) = ipam.allocate(sid(1)).unwrap();
        assert!(is_new);
        assert_ne!(again.ip, first.ip, "hint moved on, address not re-granted");
    }

    #[test]
    fn exhaustion_on_tiny_subnet() {
        let ipam = mgr("10.8.0.0/30");
        ipam.allocate(sid(1)).unwrap();
        assert_eq!(ipam.allocate(sid(2)), Err(IpamError::Exhausted));
    }

    #[test]
    fn no_usable_hosts_at_all() {
        let ipam = mgr("10.8.0.0/31");
        assert_eq!(ipam.allocate(sid(1)), Err(IpamError::Exhausted));
    }

    #[test]
    fn allocation_crosses_octet_boundary() {
        let ipam = mgr("10.8.0.0/23");
        ipam.set_next_hint(Ipv4Addr::new(10, 8, 0, 254));
        let ips: Vec<_> = (0..3)
            .map(|b| ipam.allocate(sid(b)).unwrap().0.ip)
            .collect();
        assert_eq!(
            ips,
            vec![
                Ipv4Addr::new(10, 8, 0, 254),
                Ipv4Addr::new(10, 8, 0, 255),
                Ipv4Addr::new(10, 8, 1, 0),
            ]
        );
    }

    #[test]
    fn broadcast_is_never_allocated() {
        let ipam = mgr("10.8.0.0/29"); // hosts .0-.7, usable .1-.6, gateway .1
        let mut ips = Vec::new();
        for b in 0..5 {
            ips.push(ipam.allocate(sid(b)).unwrap().0.ip);
        }
        assert!(!ips.contains(&Ipv4Addr::new(10, 8, 0, 0)));
        assert!(!ips.contains(&Ipv4Addr::new(10, 8, 0, 1)));
        assert!(!ips.contains(&Ipv4Addr::new(10, 8, 0, 7)));
        assert_eq!(ipam.allocate(sid(5)), Err(IpamError::Exhausted));
    }

    #[test]
    fn expired_lease_is_reallocated() {
        let ipam = Ipam::new(net("10.8.0.0/30"), Duration::from_millis(20));
        let (lease, _) = ipam.allocate(sid(1)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        let (other, is_new) = ipam.allocate(sid(2)).unwrap();
        assert!(is_new);
        assert_eq!(other.ip, lease.ip);
    }

    #[test]
    fn touch_extends_a_live_lease() {
        let ipam = Ipam::new(net("10.8.0.0/24"), Duration::from_millis(80));
        ipam.allocate(sid(1)).unwrap();
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(40));
            ipam.touch(&sid(1));
        }
        let (_, is_new) = ipam.allocate(sid(1)).unwrap();
        assert!(!is_new, "touched lease must still be live");
    }

    #[test]
    fn sweep_reports_reaped_count() {
        let ipam = Ipam::new(net("10.8.0.0/24"), Duration::from_secs(600));
        for b in 0..4 {
            ipam.allocate(sid(b)).unwrap();
        }
        ipam.release(&sid(0));
        ipam.release(&sid(1));
        assert_eq!(ipam.sweep(), 2);
        assert_eq!(ipam.sweep(), 0);
    }

    #[test]
    fn stats_counts_live_leases() {
        let ipam = mgr("10.8.0.0/24");
        assert_eq!(ipam.stats(), (254, 0));
        ipam.allocate(sid(1)).unwrap();
        ipam.allocate(sid(2)).unwrap();
        assert_eq!(ipam.stats(), (254, 2));
        ipam.release(&sid(1));
        assert_eq!(ipam.stats(), (254, 1));
    }

    #[test]
    fn gateway_helper() {
        let ipam = mgr("10.8.0.0/24");
        assert_eq!(ipam.gateway(), Ipv4Addr::new(10, 8, 0, 1));
    }
}
