//! Session store for established peers.
//!
//! The map owns every [`HostInfo`]; everything else refers to a session by
//! index and looks it up again, so a lookup never extends a session's
//! lifetime. Sessions are created by the handshake subsystem and destroyed
//! on explicit close, recv-error teardown or handshake replacement.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use log::info;

use crate::cert::PeerCert;
use crate::crypto::CipherState;
use crate::window::ReplayWindow;

/// Keys and replay state for an established tunnel.
///
/// Nulled (set to `None` on the owning [`HostInfo`]) when a session is torn
/// down for fast reconnect, so a stale record can never reuse counters.
pub struct ConnectionState {
    /// Decrypts traffic from the peer.
    pub rx: CipherState,
    /// Encrypts traffic to the peer.
    pub tx: CipherState,
    /// Inbound replay window, single-writer per session.
    pub window: ReplayWindow,
    tx_counter: u64,
}

impl ConnectionState {
    pub fn new(rx: CipherState, tx: CipherState, window: ReplayWindow) -> Self {
        Self {
            rx,
            tx,
            window,
            tx_counter: 0,
        }
    }

    /// Next outbound message counter. Counter zero is never sent.
    pub fn next_counter(&mut self) -> u64 {
        self.tx_counter += 1;
        self.tx_counter
    }
}

/// Per-peer session record.
pub struct HostInfo {
    /// Overlay address of the peer.
    pub vpn_ip: Ipv4Addr,
    /// Index we assigned; peers address us with it.
    pub local_index: u32,
    /// Index the peer assigned; we address them with it.
    pub remote_index: u32,
    /// Current UDP endpoint of the peer.
    pub remote: SocketAddr,
    /// When the last accepted roam happened.
    pub last_roam: Option<Instant>,
    /// The endpoint the peer roamed away from.
    pub last_roam_remote: Option<SocketAddr>,
    pub connection: Option<ConnectionState>,
    pub cert: PeerCert,
    recv_error_count: u32,
}

impl HostInfo {
    pub fn new(
        vpn_ip: Ipv4Addr,
        local_index: u32,
        remote_index: u32,
        remote: SocketAddr,
        connection: Option<ConnectionState>,
        cert: PeerCert,
    ) -> Self {
        Self {
            vpn_ip,
            local_index,
            remote_index,
            remote,
            last_roam: None,
            last_roam_remote: None,
            connection,
            cert,
            recv_error_count: 0,
        }
    }

    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.remote = addr;
    }

    /// Count an inbound recv-error claim. True once the session has seen
    /// enough of them to be considered degraded.
    pub fn recv_error_exceeded(&mut self, threshold: u32) -> bool {
        self.recv_error_count = self.recv_error_count.saturating_add(1);
        self.recv_error_count >= threshold
    }
}

/// Owner of all established sessions, addressable three ways: by our local
/// index (what peers put in the outer header), by the peer-assigned
/// reverse index (what recv-errors reference) and by overlay address.
#[derive(Default)]
pub struct HostMap {
    by_index: HashMap<u32, HostInfo>,
    by_vpn_ip: HashMap<Ipv4Addr, u32>,
    reverse_index: HashMap<u32, u32>,
}

impl HostMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session created by the handshake subsystem. A session with
    /// the same overlay address is replaced.
    pub fn add(&mut self, host: HostInfo) {
        info!(
            "session added: {} index {} remote {}",
            host.vpn_ip, host.local_index, host.remote
        );
        if let Some(previous) = self.by_vpn_ip.insert(host.vpn_ip, host.local_index) {
            self.remove_indexes(previous);
        }
        self.reverse_index.insert(host.remote_index, host.local_index);
        self.by_index.insert(host.local_index, host);
    }

    pub fn query_index(&mut self, index: u32) -> Option<&mut HostInfo> {
        self.by_index.get_mut(&index)
    }

    pub fn query_reverse_index(&mut self, remote_index: u32) -> Option<&mut HostInfo> {
        let local = *self.reverse_index.get(&remote_index)?;
        self.by_index.get_mut(&local)
    }

    pub fn query_vpn_ip(&mut self, vpn_ip: Ipv4Addr) -> Option<&mut HostInfo> {
        let local = *self.by_vpn_ip.get(&vpn_ip)?;
        self.by_index.get_mut(&local)
    }

    /// Remove a session by overlay address. Idempotent; late datagrams for
    /// a deleted session simply fail lookup.
    pub fn delete_vpn_ip(&mut self, vpn_ip: Ipv4Addr) -> Option<HostInfo> {
        let local = self.by_vpn_ip.remove(&vpn_ip)?;
        let host = self.remove_indexes(local);
        if host.is_some() {
            info!("session removed: {}", vpn_ip);
        }
        host
    }

    fn remove_indexes(&mut self, local_index: u32) -> Option<HostInfo> {
        let host = self.by_index.remove(&local_index)?;
        self.reverse_index.remove(&host.remote_index);
        Some(host)
    }

    /// Pick an unused local index for a new session.
    pub fn assign_local_index(&self) -> u32 {
        loop {
            let candidate: u32 = rand::random();
            if candidate != 0 && !self.by_index.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherState;
    use crate::metrics::Metrics;
    use crate::window::ReplayWindow;

    fn host(vpn_ip: Ipv4Addr, local_index: u32, remote_index: u32) -> HostInfo {
        let metrics = Metrics::new();
        let connection = ConnectionState::new(
            CipherState::new(&[0u8; 32], [0u8; 4]),
            CipherState::new(&[1u8; 32], [1u8; 4]),
            ReplayWindow::new(16, metrics),
        );
        HostInfo::new(
            vpn_ip,
            local_index,
            remote_index,
            "192.0.2.10:4242".parse().unwrap(),
            Some(connection),
            PeerCert {
                name: "peer".into(),
                vpn_ip,
                issuer: "ca-test".into(),
            },
        )
    }

    #[test]
    fn test_lookups_by_all_three_keys() {
        let mut map = HostMap::new();
        let vpn_ip = Ipv4Addr::new(10, 128, 0, 2);
        map.add(host(vpn_ip, 100, 200));

        assert_eq!(map.query_index(100).unwrap().vpn_ip, vpn_ip);
        assert_eq!(map.query_reverse_index(200).unwrap().local_index, 100);
        assert_eq!(map.query_vpn_ip(vpn_ip).unwrap().remote_index, 200);
        assert!(map.query_index(101).is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut map = HostMap::new();
        let vpn_ip = Ipv4Addr::new(10, 128, 0, 2);
        map.add(host(vpn_ip, 100, 200));

        assert!(map.delete_vpn_ip(vpn_ip).is_some());
        assert!(map.delete_vpn_ip(vpn_ip).is_none());
        assert!(map.query_index(100).is_none());
        assert!(map.query_reverse_index(200).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_replacement_drops_the_old_indexes() {
        let mut map = HostMap::new();
        let vpn_ip = Ipv4Addr::new(10, 128, 0, 2);
        map.add(host(vpn_ip, 100, 200));
        map.add(host(vpn_ip, 111, 222));

        assert_eq!(map.len(), 1);
        assert!(map.query_index(100).is_none());
        assert!(map.query_reverse_index(200).is_none());
        assert_eq!(map.query_vpn_ip(vpn_ip).unwrap().local_index, 111);
    }

    #[test]
    fn test_assigned_indexes_are_unused() {
        let mut map = HostMap::new();
        map.add(host(Ipv4Addr::new(10, 128, 0, 2), 100, 200));

        for _ in 0..32 {
            let index = map.assign_local_index();
            assert_ne!(index, 0);
            assert_ne!(index, 100);
        }
    }

    #[test]
    fn test_recv_error_threshold() {
        let mut h = host(Ipv4Addr::new(10, 128, 0, 2), 100, 200);

        assert!(!h.recv_error_exceeded(3));
        assert!(!h.recv_error_exceeded(3));
        assert!(h.recv_error_exceeded(3));
        assert!(h.recv_error_exceeded(3), "stays exceeded once reached");
    }

    #[test]
    fn test_tx_counter_starts_at_one() {
        let mut conn = ConnectionState::new(
            CipherState::new(&[0u8; 32], [0u8; 4]),
            CipherState::new(&[1u8; 32], [1u8; 4]),
            ReplayWindow::new(16, Metrics::new()),
        );

        assert_eq!(conn.next_counter(), 1);
        assert_eq!(conn.next_counter(), 2);
    }
}
