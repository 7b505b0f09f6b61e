//! Lighthouse seam: peer address advertisement and the roaming allow policy.
//!
//! A lighthouse is a peer that advertises where other peers can be
//! reached. The query protocol's payload format lives outside the data
//! plane; the dispatcher only routes decrypted payloads here and updates
//! advertisements when peers roam.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::cert::PeerCert;

pub trait Lighthouse {
    /// Process a decrypted lighthouse payload from an established session.
    fn handle_request(&mut self, from: SocketAddr, vpn_ip: Ipv4Addr, payload: &[u8], cert: &PeerCert);

    /// Forget every advertised address for a peer.
    fn delete_vpn_ip(&mut self, vpn_ip: Ipv4Addr);

    /// Advertise an address for a peer.
    fn add_remote(&mut self, vpn_ip: Ipv4Addr, addr: SocketAddr, preferred: bool);

    /// Roaming allow policy over the claimed new source address.
    fn allow_roam(&self, addr: SocketAddr) -> bool;
}

/// IPv4 prefix for the roaming allow list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    net: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        };
        (u32::from(ip) & mask) == (u32::from(self.net) & mask)
    }
}

impl FromStr for Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (net, prefix) = match s.split_once('/') {
            Some((net, prefix)) => (net, prefix),
            None => (s, "32"),
        };
        let net: Ipv4Addr = net
            .parse()
            .with_context(|| format!("invalid network in {:?}", s))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("invalid prefix in {:?}", s))?;
        if prefix > 32 {
            bail!("prefix {} out of range in {:?}", prefix, s);
        }
        Ok(Self { net, prefix })
    }
}

/// In-memory lighthouse state with a roaming allow list.
///
/// An empty allow list admits every address.
pub struct LighthouseMap {
    remotes: HashMap<Ipv4Addr, Vec<(SocketAddr, bool)>>,
    allow_roam: Vec<Cidr>,
}

impl LighthouseMap {
    pub fn new(allow_roam: Vec<Cidr>) -> Self {
        Self {
            remotes: HashMap::new(),
            allow_roam,
        }
    }

    pub fn remotes(&self, vpn_ip: Ipv4Addr) -> &[(SocketAddr, bool)] {
        self.remotes.get(&vpn_ip).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Lighthouse for LighthouseMap {
    fn handle_request(
        &mut self,
        from: SocketAddr,
        vpn_ip: Ipv4Addr,
        payload: &[u8],
        _cert: &PeerCert,
    ) {
        // Payload semantics belong to the query protocol; reaching us at
        // all proves the peer is live at `from`.
        debug!(
            "lighthouse request from {} ({}, {} bytes)",
            vpn_ip,
            from,
            payload.len()
        );
        self.add_remote(vpn_ip, from, false);
    }

    fn delete_vpn_ip(&mut self, vpn_ip: Ipv4Addr) {
        if self.remotes.remove(&vpn_ip).is_some() {
            debug!("lighthouse mapping removed for {}", vpn_ip);
        }
    }

    fn add_remote(&mut self, vpn_ip: Ipv4Addr, addr: SocketAddr, preferred: bool) {
        let entries = self.remotes.entry(vpn_ip).or_default();
        if let Some(entry) = entries.iter_mut().find(|(a, _)| *a == addr) {
            entry.1 = preferred;
            return;
        }
        entries.push((addr, preferred));
    }

    fn allow_roam(&self, addr: SocketAddr) -> bool {
        if self.allow_roam.is_empty() {
            return true;
        }
        match addr.ip() {
            IpAddr::V4(ip) => self.allow_roam.iter().any(|cidr| cidr.contains(ip)),
            IpAddr::V6(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_and_match() {
        let cidr: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(cidr.contains(Ipv4Addr::new(10, 200, 1, 1)));
        assert!(!cidr.contains(Ipv4Addr::new(11, 0, 0, 1)));

        let single: Cidr = "192.0.2.7".parse().unwrap();
        assert!(single.contains(Ipv4Addr::new(192, 0, 2, 7)));
        assert!(!single.contains(Ipv4Addr::new(192, 0, 2, 8)));

        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_zero_prefix_matches_everything() {
        let cidr: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(cidr.contains(Ipv4Addr::new(255, 255, 255, 255)));
    }

    #[test]
    fn test_empty_allow_list_admits_all() {
        let lh = LighthouseMap::new(Vec::new());
        assert!(lh.allow_roam("203.0.113.9:4242".parse().unwrap()));
    }

    #[test]
    fn test_allow_list_filters_roams() {
        let lh = LighthouseMap::new(vec!["192.0.2.0/24".parse().unwrap()]);
        assert!(lh.allow_roam("192.0.2.50:4242".parse().unwrap()));
        assert!(!lh.allow_roam("198.51.100.1:4242".parse().unwrap()));
        assert!(!lh.allow_roam("[2001:db8::1]:4242".parse().unwrap()));
    }

    #[test]
    fn test_add_remote_deduplicates() {
        let mut lh = LighthouseMap::new(Vec::new());
        let vpn_ip = Ipv4Addr::new(10, 128, 0, 2);
        let addr: SocketAddr = "192.0.2.10:4242".parse().unwrap();

        lh.add_remote(vpn_ip, addr, false);
        lh.add_remote(vpn_ip, addr, true);
        assert_eq!(lh.remotes(vpn_ip), &[(addr, true)]);

        lh.delete_vpn_ip(vpn_ip);
        assert!(lh.remotes(vpn_ip).is_empty());
    }
}
