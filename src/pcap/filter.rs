//! Packet filter expressions
//!
//! Readers accept the small subset of BPF syntax the engine itself issues:
//! an empty expression, `udp`, `udp port N`, `udp dst port N` and
//! `udp src port N`.

use super::ip::{IPPROTO_UDP, transport_protocol};
use crate::{CaptureError, Result};
use etherparse::UdpHeaderSlice;
use std::fmt;
use std::str::FromStr;

/// Compiled filter applied to every datagram read from a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketFilter {
    #[default]
    All,
    Udp,
    UdpPort(u16),
    UdpDstPort(u16),
    UdpSrcPort(u16),
}

impl PacketFilter {
    /// `udp port N` when a port is known, plain `udp` otherwise.
    pub fn udp_port(port: Option<u16>) -> Self {
        port.map(PacketFilter::UdpPort).unwrap_or(PacketFilter::Udp)
    }

    /// Test a complete datagram whose IP header is `ip_len` bytes long.
    pub fn matches_datagram(&self, l3: &[u8], ip_len: usize) -> bool {
        if *self == PacketFilter::All {
            return true;
        }
        if transport_protocol(l3) != Some(IPPROTO_UDP) {
            return false;
        }
        let Some(udp) = l3.get(ip_len..).and_then(|rest| UdpHeaderSlice::from_slice(rest).ok()) else {
            return false;
        };
        let (src, dst) = (udp.source_port(), udp.destination_port());
        match *self {
            PacketFilter::All | PacketFilter::Udp => true,
            PacketFilter::UdpPort(port) => src == port || dst == port,
            PacketFilter::UdpDstPort(port) => dst == port,
            PacketFilter::UdpSrcPort(port) => src == port,
        }
    }

    /// Test a non-first fragment, which carries no transport header.
    pub fn matches_fragment(&self, l3: &[u8]) -> bool {
        *self == PacketFilter::All || transport_protocol(l3) == Some(IPPROTO_UDP)
    }
}

impl FromStr for PacketFilter {
    type Err = CaptureError;

    fn from_str(expression: &str) -> Result<Self> {
        let tokens: Vec<&str> = expression.split_whitespace().collect();
        let port = |token: &str| {
            token.parse::<u16>().map_err(|_| {
                CaptureError::config(format!("invalid port '{}' in filter '{}'", token, expression))
            })
        };
        match tokens.as_slice() {
            [] => Ok(PacketFilter::All),
            ["udp"] => Ok(PacketFilter::Udp),
            ["udp", "port", p] => Ok(PacketFilter::UdpPort(port(p)?)),
            ["udp", "dst", "port", p] => Ok(PacketFilter::UdpDstPort(port(p)?)),
            ["udp", "src", "port", p] => Ok(PacketFilter::UdpSrcPort(port(p)?)),
            _ => Err(CaptureError::config(format!("unsupported filter expression '{}'", expression))),
        }
    }
}

impl fmt::Display for PacketFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketFilter::All => Ok(()),
            PacketFilter::Udp => f.write_str("udp"),
            PacketFilter::UdpPort(port) => write!(f, "udp port {}", port),
            PacketFilter::UdpDstPort(port) => write!(f, "udp dst port {}", port),
            PacketFilter::UdpSrcPort(port) => write!(f, "udp src port {}", port),
        }
    }
}
