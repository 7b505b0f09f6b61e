use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::header::MsgType;

/// Prometheus-compatible metrics for the Veilmesh data plane.
///
/// Shared by `Arc` between the dispatcher, the per-session replay windows
/// and the HTTP exporter. Tests construct their own registry; nothing here
/// is process-global.
pub struct Metrics {
    // Replay window accounting. Advisory only, never consulted by the
    // admission logic itself.
    pub packets_lost: AtomicU64,
    pub packets_duplicate: AtomicU64,
    pub packets_out_of_window: AtomicU64,

    // Per-type inbound counters.
    pub rx_message: AtomicU64,
    pub rx_lighthouse: AtomicU64,
    pub rx_test: AtomicU64,
    pub rx_handshake: AtomicU64,
    pub rx_recv_error: AtomicU64,
    pub rx_close_tunnel: AtomicU64,
    pub rx_unknown: AtomicU64,
    pub rx_malformed: AtomicU64,

    // Outbound control traffic originated by the dispatcher.
    pub tx_recv_error: AtomicU64,
    pub tx_test_reply: AtomicU64,

    pub tun_write_errors: AtomicU64,
    pub roams: AtomicU64,
    /// Gauge, refreshed by the periodic sweep in the main loop.
    pub sessions_active: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl Metrics {
    fn new_inner() -> Self {
        Self {
            packets_lost: AtomicU64::new(0),
            packets_duplicate: AtomicU64::new(0),
            packets_out_of_window: AtomicU64::new(0),
            rx_message: AtomicU64::new(0),
            rx_lighthouse: AtomicU64::new(0),
            rx_test: AtomicU64::new(0),
            rx_handshake: AtomicU64::new(0),
            rx_recv_error: AtomicU64::new(0),
            rx_close_tunnel: AtomicU64::new(0),
            rx_unknown: AtomicU64::new(0),
            rx_malformed: AtomicU64::new(0),
            tx_recv_error: AtomicU64::new(0),
            tx_test_reply: AtomicU64::new(0),
            tun_write_errors: AtomicU64::new(0),
            roams: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
        }
    }

    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    pub fn inc_lost(&self, n: u64) {
        self.packets_lost.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_duplicate(&self) {
        self.packets_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_out_of_window(&self) {
        self.packets_out_of_window.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one inbound datagram by parsed message type.
    pub fn count_rx(&self, msg_type: Option<MsgType>) {
        let counter = match msg_type {
            Some(MsgType::Message) => &self.rx_message,
            Some(MsgType::LightHouse) => &self.rx_lighthouse,
            Some(MsgType::Test) => &self.rx_test,
            Some(MsgType::Handshake) => &self.rx_handshake,
            Some(MsgType::RecvError) => &self.rx_recv_error,
            Some(MsgType::CloseTunnel) => &self.rx_close_tunnel,
            None => &self.rx_unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rx_malformed(&self) {
        self.rx_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tx_recv_error(&self) {
        self.tx_recv_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tx_test_reply(&self) {
        self.tx_test_reply.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tun_write_errors(&self) {
        self.tun_write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_roams(&self) {
        self.roams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_sessions(&self, count: u64) {
        self.sessions_active.store(count, Ordering::Relaxed);
    }

    /// Total inbound datagrams across every type tag, recognized or not.
    pub fn rx_total(&self) -> u64 {
        [
            &self.rx_message,
            &self.rx_lighthouse,
            &self.rx_test,
            &self.rx_handshake,
            &self.rx_recv_error,
            &self.rx_close_tunnel,
            &self.rx_unknown,
        ]
        .iter()
        .map(|counter| counter.load(Ordering::Relaxed))
        .sum()
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP veil_packets_lost_total Counters skipped past by the replay window\n\
             # TYPE veil_packets_lost_total counter\n\
             veil_packets_lost_total {}\n\
             # HELP veil_packets_duplicate_total Datagrams rejected as replays\n\
             # TYPE veil_packets_duplicate_total counter\n\
             veil_packets_duplicate_total {}\n\
             # HELP veil_packets_out_of_window_total Datagrams older than the replay window\n\
             # TYPE veil_packets_out_of_window_total counter\n\
             veil_packets_out_of_window_total {}\n\
             # HELP veil_rx_message_total Tunnel data datagrams received\n\
             # TYPE veil_rx_message_total counter\n\
             veil_rx_message_total {}\n\
             # HELP veil_rx_lighthouse_total Lighthouse datagrams received\n\
             # TYPE veil_rx_lighthouse_total counter\n\
             veil_rx_lighthouse_total {}\n\
             # HELP veil_rx_test_total Test datagrams received\n\
             # TYPE veil_rx_test_total counter\n\
             veil_rx_test_total {}\n\
             # HELP veil_rx_handshake_total Handshake datagrams received\n\
             # TYPE veil_rx_handshake_total counter\n\
             veil_rx_handshake_total {}\n\
             # HELP veil_rx_recv_error_total Recv-error datagrams received\n\
             # TYPE veil_rx_recv_error_total counter\n\
             veil_rx_recv_error_total {}\n\
             # HELP veil_rx_close_tunnel_total Close-tunnel datagrams received\n\
             # TYPE veil_rx_close_tunnel_total counter\n\
             veil_rx_close_tunnel_total {}\n\
             # HELP veil_rx_unknown_total Datagrams with an unrecognized type tag\n\
             # TYPE veil_rx_unknown_total counter\n\
             veil_rx_unknown_total {}\n\
             # HELP veil_rx_malformed_total Datagrams with an unparseable outer header\n\
             # TYPE veil_rx_malformed_total counter\n\
             veil_rx_malformed_total {}\n\
             # HELP veil_tx_recv_error_total Recv-error responses sent\n\
             # TYPE veil_tx_recv_error_total counter\n\
             veil_tx_recv_error_total {}\n\
             # HELP veil_tx_test_reply_total Test replies sent\n\
             # TYPE veil_tx_test_reply_total counter\n\
             veil_tx_test_reply_total {}\n\
             # HELP veil_tun_write_errors_total Failed writes to the TUN device\n\
             # TYPE veil_tun_write_errors_total counter\n\
             veil_tun_write_errors_total {}\n\
             # HELP veil_roams_total Accepted peer address changes\n\
             # TYPE veil_roams_total counter\n\
             veil_roams_total {}\n\
             # HELP veil_sessions_active Current number of established sessions\n\
             # TYPE veil_sessions_active gauge\n\
             veil_sessions_active {}\n",
            self.packets_lost.load(Ordering::Relaxed),
            self.packets_duplicate.load(Ordering::Relaxed),
            self.packets_out_of_window.load(Ordering::Relaxed),
            self.rx_message.load(Ordering::Relaxed),
            self.rx_lighthouse.load(Ordering::Relaxed),
            self.rx_test.load(Ordering::Relaxed),
            self.rx_handshake.load(Ordering::Relaxed),
            self.rx_recv_error.load(Ordering::Relaxed),
            self.rx_close_tunnel.load(Ordering::Relaxed),
            self.rx_unknown.load(Ordering::Relaxed),
            self.rx_malformed.load(Ordering::Relaxed),
            self.tx_recv_error.load(Ordering::Relaxed),
            self.tx_test_reply.load(Ordering::Relaxed),
            self.tun_write_errors.load(Ordering::Relaxed),
            self.roams.load(Ordering::Relaxed),
            self.sessions_active.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.packets_lost.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.rx_message.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_rx_counters_by_type() {
        let metrics = Metrics::new();

        metrics.count_rx(Some(MsgType::Message));
        metrics.count_rx(Some(MsgType::Message));
        metrics.count_rx(Some(MsgType::Test));
        metrics.count_rx(None);

        assert_eq!(metrics.rx_message.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.rx_test.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.rx_unknown.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.rx_lighthouse.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.rx_total(), 4);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.inc_lost(83);
        metrics.inc_duplicate();
        metrics.count_rx(Some(MsgType::LightHouse));

        let output = metrics.to_prometheus();
        assert!(output.contains("veil_packets_lost_total 83"));
        assert!(output.contains("veil_packets_duplicate_total 1"));
        assert!(output.contains("veil_rx_lighthouse_total 1"));
        assert!(output.contains("veil_sessions_active 0"));
    }
}
