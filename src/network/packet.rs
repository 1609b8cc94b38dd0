//! Synthetic Ethernet/IPv4/UDP framing for bare payloads
//!
//! Live datagrams arrive without their link and network headers. To store them
//! in a capture file they are wrapped in a minimal frame: broadcast Ethernet
//! destination, IPv4 with DF set and TTL 255, UDP with a zero checksum.

use crate::{CaptureError, Result};
use std::net::Ipv4Addr;

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const ETHERTYPE_IPV4: u16 = 0x0800;

/// Total size of the headers prepended to every payload.
pub const SYNTHETIC_HEADERS_LEN: usize = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN;

/// Builds link-layer frames around UDP payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPacketBuilder {
    pub source_mac: [u8; 6],
    pub source_ip: Ipv4Addr,
    pub destination_ip: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
    /// IPv4 identification field
    pub identification: u16,
}

impl Default for UdpPacketBuilder {
    fn default() -> Self {
        Self {
            source_mac: [0xff; 6],
            source_ip: Ipv4Addr::new(192, 168, 1, 200),
            destination_ip: Ipv4Addr::BROADCAST,
            source_port: 2368,
            destination_port: 2368,
            identification: 0,
        }
    }
}

impl UdpPacketBuilder {
    pub fn new(source_port: u16, destination_port: u16) -> Self {
        Self { source_port, destination_port, ..Self::default() }
    }

    pub fn with_source_ip(mut self, ip: Ipv4Addr) -> Self {
        self.source_ip = ip;
        self
    }

    pub fn with_identification(mut self, identification: u16) -> Self {
        self.identification = identification;
        self
    }

    /// Wrap `payload` in Ethernet, IPv4 and UDP headers.
    ///
    /// Fails when the payload does not fit in a single IPv4 datagram.
    pub fn build(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let udp_len = u16::try_from(UDP_HEADER_LEN + payload.len())
            .ok()
            .filter(|len| (*len as usize) + IPV4_HEADER_LEN <= u16::MAX as usize)
            .ok_or_else(|| {
                CaptureError::parse("UDP framing", format!("payload of {} bytes is too large", payload.len()))
            })?;
        let ip_len = udp_len + IPV4_HEADER_LEN as u16;

        let mut frame = Vec::with_capacity(SYNTHETIC_HEADERS_LEN + payload.len());

        // Ethernet II
        frame.extend_from_slice(&[0xff; 6]);
        frame.extend_from_slice(&self.source_mac);
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        // IPv4, no options
        frame.push(0x45);
        frame.push(0x00);
        frame.extend_from_slice(&ip_len.to_be_bytes());
        frame.extend_from_slice(&self.identification.to_be_bytes());
        frame.extend_from_slice(&0x4000u16.to_be_bytes());
        frame.push(0xff);
        frame.push(17);
        // checksum is not computed
        frame.extend_from_slice(&0xffffu16.to_be_bytes());
        frame.extend_from_slice(&self.source_ip.octets());
        frame.extend_from_slice(&self.destination_ip.octets());

        // UDP
        frame.extend_from_slice(&self.source_port.to_be_bytes());
        frame.extend_from_slice(&self.destination_port.to_be_bytes());
        frame.extend_from_slice(&udp_len.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());

        frame.extend_from_slice(payload);
        Ok(frame)
    }
}
