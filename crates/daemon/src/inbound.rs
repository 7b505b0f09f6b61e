//! Inbound packet dispatch: the receive-side state machine.
//!
//! One call per datagram. The dispatcher authenticates before it
//! observes: the replay window mutates only after AEAD verification.
//! Roaming and liveness accounting run once the replay gate admits a
//! counter. A session is owned by the host map and touched by one worker
//! at a time, so no locks are held here.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::net::UdpSocket;

use crate::cert::CaPool;
use crate::connection::ConnectionTracker;
use crate::firewall::{Firewall, FirewallPacket};
use crate::header::{Header, MsgType, HEADER_LEN, PROTOCOL_VERSION, TEST_REPLY, TEST_REQUEST};
use crate::hostmap::HostMap;
use crate::lighthouse::Lighthouse;
use crate::metrics::Metrics;
use crate::tun::Tun;

/// Sink for raw handshake datagrams. Negotiation happens outside the data
/// plane; these bytes are unauthenticated at this layer.
pub trait HandshakeSink {
    /// Hand over a handshake datagram as received from the wire.
    fn handle(&mut self, from: SocketAddr, data: &[u8], header: &Header);

    /// Drop any half-open state for a peer (fast-reconnect path).
    fn forget(&mut self, vpn_ip: Ipv4Addr);
}

/// Logs and drops handshake traffic when no negotiator is attached.
pub struct NullHandshake;

impl HandshakeSink for NullHandshake {
    fn handle(&mut self, from: SocketAddr, data: &[u8], _header: &Header) {
        debug!(
            "handshake datagram from {} ({} bytes), no negotiator attached",
            from,
            data.len()
        );
    }

    fn forget(&mut self, _vpn_ip: Ipv4Addr) {}
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct InboundConfig {
    /// Minimum time before a peer may roam back to its previous address.
    pub roam_suppress: Duration,
    /// Inbound recv-errors ignored before a session counts as degraded.
    pub recv_error_threshold: u32,
    /// Whether this node advertises peers to others.
    pub am_lighthouse: bool,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            roam_suppress: Duration::from_secs(30),
            recv_error_threshold: 4,
            am_lighthouse: false,
        }
    }
}

/// The inbound dispatcher. Collaborators are injected at construction so
/// tests can supply their own; nothing here is process-global.
pub struct Inbound<F, L, T, H>
where
    F: Firewall,
    L: Lighthouse,
    T: Tun,
    H: HandshakeSink,
{
    pub hostmap: HostMap,
    pub connections: ConnectionTracker,
    pub firewall: F,
    pub lighthouse: L,
    pub tun: T,
    pub handshake: H,
    pub outside: Arc<UdpSocket>,
    pub metrics: Arc<Metrics>,
    pub trusted_cas: CaPool,
    pub config: InboundConfig,
}

impl<F, L, T, H> Inbound<F, L, T, H>
where
    F: Firewall,
    L: Lighthouse,
    T: Tun,
    H: HandshakeSink,
{
    /// Process one datagram from the outside socket.
    pub async fn handle_packet(&mut self, from: SocketAddr, data: &[u8]) {
        let header = match Header::parse(data) {
            Ok(h) => h,
            Err(e) => {
                // Hole punches are zero or one byte; anything longer that
                // fails to parse is worth a line.
                if data.len() > 1 {
                    self.metrics.inc_rx_malformed();
                    info!("error parsing inbound packet from {}: {}", from, e);
                }
                return;
            }
        };

        if header.version != PROTOCOL_VERSION {
            debug!(
                "peer {} speaks version {}, ours is {}",
                from, header.version, PROTOCOL_VERSION
            );
        }

        let typed = header.typed();
        self.metrics.count_rx(typed);

        match typed {
            Some(MsgType::Message) => {
                if !self.handle_encrypted(from, &header).await {
                    return;
                }
                self.decrypt_to_tun(from, &header, data);
            }

            Some(MsgType::LightHouse) => {
                if !self.handle_encrypted(from, &header).await {
                    return;
                }
                let Some(plaintext) = self.decrypt(from, &header, data) else {
                    return;
                };
                let (vpn_ip, cert) = match self.hostmap.query_index(header.remote_index) {
                    Some(host) => (host.vpn_ip, host.cert.clone()),
                    None => return,
                };
                self.lighthouse.handle_request(from, vpn_ip, &plaintext, &cert);
            }

            Some(MsgType::Test) => {
                if !self.handle_encrypted(from, &header).await {
                    return;
                }
                let Some(plaintext) = self.decrypt(from, &header, data) else {
                    return;
                };
                if header.subtype == TEST_REQUEST {
                    // Roam first so the echo goes to the address the peer
                    // is probing from.
                    self.handle_roaming(header.remote_index, from);
                    self.send_test_reply(header.remote_index, &plaintext).await;
                }
            }

            // Unauthenticated from here on down; these must not fall
            // through to roaming or liveness accounting.
            Some(MsgType::Handshake) => {
                self.handshake.handle(from, data, &header);
                return;
            }

            Some(MsgType::RecvError) => {
                self.handle_recv_error(from, &header);
                return;
            }

            Some(MsgType::CloseTunnel) => {
                if !self.handle_encrypted(from, &header).await {
                    return;
                }
                let Some(vpn_ip) = self
                    .hostmap
                    .query_index(header.remote_index)
                    .map(|h| h.vpn_ip)
                else {
                    return;
                };
                info!("close tunnel received from {}, tearing down {}", from, vpn_ip);
                self.close_tunnel(vpn_ip);
                return;
            }

            None => {
                debug!("unexpected packet type {} from {}", header.msg_type, from);
                return;
            }
        }

        // Post-processing shared by the fall-through types above.
        self.handle_roaming(header.remote_index, from);
        if let Some(vpn_ip) = self
            .hostmap
            .query_index(header.remote_index)
            .map(|h| h.vpn_ip)
        {
            self.connections.seen_in(vpn_ip);
        }
    }

    /// Gate common to all encrypted types: a known session whose replay
    /// window accepts the counter. Rejections answer with a recv-error so
    /// a peer that lost our session re-handshakes quickly.
    async fn handle_encrypted(&mut self, from: SocketAddr, header: &Header) -> bool {
        let admissible = self
            .hostmap
            .query_index(header.remote_index)
            .and_then(|host| host.connection.as_ref())
            .map(|conn| conn.window.check(header.counter))
            .unwrap_or(false);

        if !admissible {
            self.send_recv_error(from, header.remote_index).await;
            return false;
        }
        true
    }

    /// AEAD-open an encrypted control payload and commit its counter.
    /// The window mutates only after authentication succeeds.
    fn decrypt(&mut self, from: SocketAddr, header: &Header, data: &[u8]) -> Option<Vec<u8>> {
        let host = self.hostmap.query_index(header.remote_index)?;
        let conn = host.connection.as_mut()?;

        let plaintext = match conn
            .rx
            .open(header.counter, &data[..HEADER_LEN], &data[HEADER_LEN..])
        {
            Ok(p) => p,
            Err(e) => {
                error!("failed to decrypt packet from {} ({}): {}", host.vpn_ip, from, e);
                return None;
            }
        };

        if !conn.window.update(header.counter) {
            debug!(
                "dropping out of window packet from {} (counter {})",
                from, header.counter
            );
            return None;
        }

        Some(plaintext)
    }

    /// The tun-bound fast path: decrypt, validate the inner packet, commit
    /// the counter, consult the firewall, deliver. Every failure drops the
    /// datagram without telling the caller; the message case falls through
    /// to roaming and liveness regardless, gated only by the replay check.
    fn decrypt_to_tun(&mut self, from: SocketAddr, header: &Header, data: &[u8]) {
        let Some(host) = self.hostmap.query_index(header.remote_index) else {
            return;
        };
        let Some(conn) = host.connection.as_mut() else {
            return;
        };

        let plaintext = match conn
            .rx
            .open(header.counter, &data[..HEADER_LEN], &data[HEADER_LEN..])
        {
            Ok(p) => p,
            Err(e) => {
                // No recv-error for failed decrypts: answering would hand
                // an attacker a padding oracle.
                error!("failed to decrypt packet from {} ({}): {}", host.vpn_ip, from, e);
                return;
            }
        };

        let fw_packet = match FirewallPacket::from_inner(&plaintext, true) {
            Ok(p) => p,
            Err(e) => {
                info!("failed to validate inbound packet from {}: {}", host.vpn_ip, e);
                return;
            }
        };

        if !conn.window.update(header.counter) {
            debug!(
                "dropping out of window packet from {} (counter {})",
                from, header.counter
            );
            return;
        }

        if let Some(reason) =
            self.firewall
                .drop_reason(&plaintext, &fw_packet, true, host, &self.trusted_cas)
        {
            debug!(
                "dropping inbound packet from {}: {} ({:?})",
                host.vpn_ip, reason, fw_packet
            );
            return;
        }

        self.connections.seen_in(host.vpn_ip);
        if let Err(e) = self.tun.write_raw(&plaintext) {
            self.metrics.inc_tun_write_errors();
            error!("failed to write to tun: {}", e);
        }
    }

    /// A peer claims it lost the session behind our index. The claim is
    /// unauthenticated, so act only on strong evidence: the reverse index
    /// resolves, the session is already degraded, and the claim comes from
    /// the session's own remote.
    fn handle_recv_error(&mut self, from: SocketAddr, header: &Header) {
        debug!("recv error received from {} (index {})", from, header.remote_index);

        let Some(host) = self.hostmap.query_reverse_index(header.remote_index) else {
            debug!("recv error for unknown reverse index {}", header.remote_index);
            return;
        };

        if !host.recv_error_exceeded(self.config.recv_error_threshold) {
            return;
        }

        if host.remote != from {
            warn!(
                "ignoring recv error for {} with mismatched source {} (expected {})",
                host.vpn_ip, from, host.remote
            );
            return;
        }

        let vpn_ip = host.vpn_ip;
        // Null the keys before dropping the record so a fast reconnect can
        // never reuse counters against the old state.
        host.connection = None;
        self.hostmap.delete_vpn_ip(vpn_ip);
        self.handshake.forget(vpn_ip);
        info!("session with {} torn down after recv error", vpn_ip);
    }

    /// Tear down a session: liveness state, lighthouse mapping, host map
    /// entry. Safe to call for sessions that are already gone.
    fn close_tunnel(&mut self, vpn_ip: Ipv4Addr) {
        self.connections.clear_ip(vpn_ip);
        self.connections.clear_pending_deletion(vpn_ip);
        self.lighthouse.delete_vpn_ip(vpn_ip);
        self.hostmap.delete_vpn_ip(vpn_ip);
    }

    /// Apply a peer source-address change once the replay gate has
    /// admitted the datagram's counter.
    fn handle_roaming(&mut self, index: u32, from: SocketAddr) {
        let Some(host) = self.hostmap.query_index(index) else {
            return;
        };
        if host.remote == from {
            return;
        }

        if !self.lighthouse.allow_roam(from) {
            debug!("roam of {} to {} denied by allow list", host.vpn_ip, from);
            return;
        }

        if let (Some(last), Some(previous)) = (host.last_roam, host.last_roam_remote) {
            if previous == from && last.elapsed() < self.config.roam_suppress {
                debug!(
                    "suppressing roam of {} back to {} ({:?} since last roam)",
                    host.vpn_ip,
                    from,
                    last.elapsed()
                );
                return;
            }
        }

        info!("host {} roamed from {} to {}", host.vpn_ip, host.remote, from);
        host.last_roam = Some(Instant::now());
        host.last_roam_remote = Some(host.remote);
        host.set_remote(from);
        self.metrics.inc_roams();

        if self.config.am_lighthouse {
            let vpn_ip = host.vpn_ip;
            self.lighthouse.add_remote(vpn_ip, from, false);
        }
    }

    /// Tell a peer the index it used is dead here so it re-handshakes.
    async fn send_recv_error(&mut self, addr: SocketAddr, index: u32) {
        self.metrics.inc_tx_recv_error();
        let buf = Header::encode(PROTOCOL_VERSION, MsgType::RecvError, 0, index, 0);
        match self.outside.send_to(&buf, addr).await {
            Ok(_) => debug!("recv error sent to {} (index {})", addr, index),
            Err(e) => debug!("failed to send recv error to {}: {}", addr, e),
        }
    }

    /// Echo a test payload back to the session's current remote.
    async fn send_test_reply(&mut self, index: u32, payload: &[u8]) {
        let Some(host) = self.hostmap.query_index(index) else {
            return;
        };
        let remote = host.remote;
        let remote_index = host.remote_index;
        let Some(conn) = host.connection.as_mut() else {
            return;
        };

        let counter = conn.next_counter();
        let header = Header::encode(PROTOCOL_VERSION, MsgType::Test, TEST_REPLY, remote_index, counter);
        let sealed = match conn.tx.seal(counter, &header, payload) {
            Ok(ct) => ct,
            Err(e) => {
                error!("failed to seal test reply: {}", e);
                return;
            }
        };

        let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&sealed);

        self.metrics.inc_tx_test_reply();
        if let Err(e) = self.outside.send_to(&out, remote).await {
            debug!("failed to send test reply to {}: {}", remote, e);
        }
    }
}
