pub mod cert;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod firewall;
pub mod header;
pub mod hostmap;
pub mod http;
pub mod inbound;
pub mod lighthouse;
pub mod metrics;
pub mod tun;
pub mod window;

// Re-export key types for easier access by consumers
pub use cert::{CaPool, PeerCert};
pub use config::Config;
pub use connection::ConnectionTracker;
pub use crypto::{CipherState, CryptoError};
pub use firewall::{DropReason, Firewall, FirewallPacket, OpenFirewall, PacketError};
pub use header::{Header, HeaderError, MsgType, HEADER_LEN, PROTOCOL_VERSION};
pub use hostmap::{ConnectionState, HostInfo, HostMap};
pub use inbound::{HandshakeSink, Inbound, InboundConfig, NullHandshake};
pub use lighthouse::{Cidr, Lighthouse, LighthouseMap};
pub use metrics::Metrics;
pub use tun::{Inside, Tun, TunConfig, TunDevice};
pub use window::ReplayWindow;
