//! Server-side TUN→session routing by destination IPv4.
//!
//! Sessions register the sender side of their outbound packet channel
//! under their leased address; the single TUN-read pump looks up the
//! destination of every packet and forwards it. The dispatcher never
//! holds a session — sessions remove themselves on close.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

/// Locked `ip -> session outbound` map.
#[derive(Default)]
pub struct Dispatcher {
    routes: Mutex<HashMap<Ipv4Addr, mpsc::Sender<Bytes>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Ipv4Addr, mpsc::Sender<Bytes>>> {
        self.routes.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Bind an address to a session's outbound channel, replacing any
    /// previous binding.
    pub fn register(&self, ip: Ipv4Addr, tx: mpsc::Sender<Bytes>) {
        self.lock().insert(ip, tx);
    }

    /// Remove the binding if it still belongs to the caller's channel.
    ///
    /// A session reconnecting under the same lease replaces the binding
    /// before the old session finishes tearing down; the old session must
    /// not yank the replacement out from under it.
    pub fn unregister(&self, ip: Ipv4Addr, tx: &mpsc::Sender<Bytes>) {
        let mut routes = self.lock();
        if routes.get(&ip).is_some_and(|cur| cur.same_channel(tx)) {
            routes.remove(&ip);
        }
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forward a packet to the session owning `dst`. Packets for unknown
    /// destinations, and packets for sessions whose channel is full or
    /// closed, are dropped silently; returns whether the packet was
    /// handed off.
    pub fn dispatch(&self, dst: Ipv4Addr, packet: Bytes) -> bool {
        let tx = match self.lock().get(&dst) {
            Some(tx) => tx.clone(),
            None => {
                trace!("packet for unregistered destination dropped");
                return false;
            }
        };
        if tx.try_send(packet).is_err() {
            trace!("session outbound channel unavailable, packet dropped");
            return false;
        }
        true
    }
}
