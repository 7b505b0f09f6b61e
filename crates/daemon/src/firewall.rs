//! Inner packet validation and the firewall seam.
//!
//! After decryption the plaintext must be a well-formed IPv4 packet. The
//! interesting fields are pulled into a locally oriented tuple which the
//! rule engine (outside this crate) decides on.

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::cert::CaPool;
use crate::hostmap::HostInfo;

/// Fixed minimum IPv4 header length.
const IPV4_HEADER_LEN: usize = 20;
/// Transport bytes needed for the port pair.
const MIN_TRANSPORT_LEN: usize = 4;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet is {0} bytes, smaller than an ipv4 header")]
    TooShort(usize),
    #[error("packet is not ipv4, version: {0}")]
    NotIpv4(u8),
    #[error("packet had an invalid header length: {0}")]
    BadHeaderLength(usize),
    #[error("packet is {got} bytes, transport tuple needs {need}")]
    TruncatedTransport { got: usize, need: usize },
}

/// The locally oriented tuple handed to the firewall.
///
/// For inbound traffic the IP source fields map to `remote`. Ports are
/// zero for non-first fragments and for ICMP, where no transport header
/// is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirewallPacket {
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: u8,
    pub fragment: bool,
}

impl FirewallPacket {
    /// Validate a plaintext inner packet and extract the firewall tuple.
    pub fn from_inner(data: &[u8], incoming: bool) -> Result<Self, PacketError> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(PacketError::TooShort(data.len()));
        }

        let version = data[0] >> 4;
        if version != 4 {
            return Err(PacketError::NotIpv4(version));
        }

        let ihl = ((data[0] & 0x0f) as usize) << 2;
        if ihl < IPV4_HEADER_LEN {
            return Err(PacketError::BadHeaderLength(ihl));
        }

        // A non-zero 13-bit offset marks a second or later fragment.
        let flags_frags = u16::from_be_bytes([data[6], data[7]]);
        let fragment = (flags_frags & 0x1fff) != 0;
        let protocol = data[9];

        let mut need = ihl;
        if !fragment && protocol != PROTO_ICMP {
            need += MIN_TRANSPORT_LEN;
        }
        if data.len() < need {
            return Err(PacketError::TruncatedTransport {
                got: data.len(),
                need,
            });
        }

        let src_ip = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let dst_ip = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let (src_port, dst_port) = if fragment || protocol == PROTO_ICMP {
            (0, 0)
        } else {
            (
                u16::from_be_bytes([data[ihl], data[ihl + 1]]),
                u16::from_be_bytes([data[ihl + 2], data[ihl + 3]]),
            )
        };

        Ok(if incoming {
            Self {
                remote_ip: src_ip,
                local_ip: dst_ip,
                remote_port: src_port,
                local_port: dst_port,
                protocol,
                fragment,
            }
        } else {
            Self {
                local_ip: src_ip,
                remote_ip: dst_ip,
                local_port: src_port,
                remote_port: dst_port,
                protocol,
                fragment,
            }
        })
    }
}

/// Why the firewall refused a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoMatchingRule,
    PeerNotTrusted,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoMatchingRule => write!(f, "no matching rule"),
            DropReason::PeerNotTrusted => write!(f, "peer not trusted"),
        }
    }
}

/// Rule evaluation seam. The matching engine lives outside the data plane.
pub trait Firewall {
    /// Return a reason to drop `packet`, or `None` to admit it.
    fn drop_reason(
        &self,
        plaintext: &[u8],
        packet: &FirewallPacket,
        incoming: bool,
        host: &HostInfo,
        cas: &CaPool,
    ) -> Option<DropReason>;
}

/// Admits everything. Used when no rule engine is wired in.
pub struct OpenFirewall;

impl Firewall for OpenFirewall {
    fn drop_reason(
        &self,
        _plaintext: &[u8],
        _packet: &FirewallPacket,
        _incoming: bool,
        _host: &HostInfo,
        _cas: &CaPool,
    ) -> Option<DropReason> {
        None
    }
}
