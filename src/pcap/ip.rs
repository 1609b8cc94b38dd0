//! IP header inspection and fragment reassembly
//!
//! Headers are decoded with `etherparse`; this module only adds what a capture
//! reader needs on top: walking the IPv6 extension chain down to the transport
//! header, and rebuilding fragmented IPv4 datagrams. IPv6 fragments are
//! reported as unsupported.

use crate::{CaptureError, Result};
use etherparse::{IpAuthHeaderSlice, Ipv4HeaderSlice, Ipv6FragmentHeaderSlice, Ipv6HeaderSlice, Ipv6RawExtHeaderSlice};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Fragment offsets are expressed in blocks of this many bytes.
pub const FRAGMENT_OFFSET_STEP: usize = 8;
pub const UDP_HEADER_LEN: usize = 8;
pub const IPPROTO_UDP: u8 = 17;

/// Datagrams waiting for fragments before the oldest one is given up.
pub const MAX_PENDING_DATAGRAMS: usize = 64;

mod next_header {
    pub const HOP_BY_HOP: u8 = 0;
    pub const ROUTING: u8 = 43;
    pub const FRAGMENT: u8 = 44;
    pub const ESP: u8 = 50;
    pub const AUTH: u8 = 51;
    pub const DESTINATION: u8 = 60;
    pub const MOBILITY: u8 = 135;
    pub const HIP: u8 = 139;
    pub const SHIM6: u8 = 140;
    pub const EXPERIMENT_1: u8 = 253;
    pub const EXPERIMENT_2: u8 = 254;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Fragmentation fields of one IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentInfo {
    pub identification: u32,
    /// Offset in units of [`FRAGMENT_OFFSET_STEP`] bytes
    pub offset: u16,
    pub more_fragments: bool,
}

impl FragmentInfo {
    /// True for any packet that is part of a fragmented datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.offset > 0
    }

    pub fn byte_offset(&self) -> usize {
        self.offset as usize * FRAGMENT_OFFSET_STEP
    }
}

/// Result of walking an IPv6 extension header chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv6Chain {
    header_len: usize,
    next_header: u8,
    fragment: Option<FragmentInfo>,
}

pub fn ip_version(l3: &[u8]) -> Option<IpVersion> {
    match l3.first()? >> 4 {
        4 => Some(IpVersion::V4),
        6 => Some(IpVersion::V6),
        _ => None,
    }
}

/// Length of the IP header including IPv6 extension headers.
///
/// Returns 0 when the header is not recognised, truncated or uses an
/// unsupported extension; callers skip such packets.
pub fn header_length(l3: &[u8]) -> usize {
    match ip_version(l3) {
        Some(IpVersion::V4) => Ipv4HeaderSlice::from_slice(l3).map(|ipv4| ipv4.slice().len()).unwrap_or(0),
        Some(IpVersion::V6) => walk_ipv6(l3).map(|chain| chain.header_len).unwrap_or(0),
        None => 0,
    }
}

/// Fragmentation fields, or `None` if the header cannot be read.
pub fn fragment_info(l3: &[u8]) -> Option<FragmentInfo> {
    match ip_version(l3)? {
        IpVersion::V4 => {
            let ipv4 = Ipv4HeaderSlice::from_slice(l3).ok()?;
            Some(FragmentInfo {
                identification: ipv4.identification() as u32,
                offset: ipv4.fragments_offset().value(),
                more_fragments: ipv4.more_fragments(),
            })
        }
        IpVersion::V6 => Some(walk_ipv6(l3)?.fragment.unwrap_or_default()),
    }
}

/// Transport protocol number carried by the packet.
pub fn transport_protocol(l3: &[u8]) -> Option<u8> {
    match ip_version(l3)? {
        IpVersion::V4 => Ipv4HeaderSlice::from_slice(l3).ok().map(|ipv4| ipv4.protocol().0),
        IpVersion::V6 => walk_ipv6(l3).map(|chain| chain.next_header),
    }
}

fn walk_ipv6(l3: &[u8]) -> Option<Ipv6Chain> {
    let ipv6 = Ipv6HeaderSlice::from_slice(l3).ok()?;
    let mut next = ipv6.next_header().0;
    let mut cursor = ipv6.slice().len();
    let mut fragment = None;

    loop {
        let rest = l3.get(cursor..)?;
        match next {
            next_header::HOP_BY_HOP | next_header::ROUTING | next_header::DESTINATION => {
                let ext = Ipv6RawExtHeaderSlice::from_slice(rest).ok()?;
                next = ext.next_header().0;
                cursor += ext.slice().len();
            }
            next_header::FRAGMENT => {
                let ext = Ipv6FragmentHeaderSlice::from_slice(rest).ok()?;
                fragment = Some(FragmentInfo {
                    identification: ext.identification(),
                    offset: ext.fragment_offset().value(),
                    more_fragments: ext.more_fragments(),
                });
                next = ext.next_header().0;
                cursor += ext.slice().len();
            }
            next_header::AUTH => {
                let ext = IpAuthHeaderSlice::from_slice(rest).ok()?;
                next = ext.next_header().0;
                cursor += ext.slice().len();
            }
            next_header::ESP
            | next_header::MOBILITY
            | next_header::HIP
            | next_header::SHIM6
            | next_header::EXPERIMENT_1
            | next_header::EXPERIMENT_2 => return None,
            _ => break,
        }
    }

    Some(Ipv6Chain { header_len: cursor, next_header: next, fragment })
}

/// Rewrite an IPv4 header so it describes a whole, unfragmented datagram.
pub fn rebuild_reassembled_header(ip_header: &mut [u8], payload_len: usize) -> Result<()> {
    match ip_version(ip_header) {
        Some(IpVersion::V4) => {
            let total = u16::try_from(ip_header.len() + payload_len).map_err(|_| {
                CaptureError::parse("IPv4 reassembly", format!("datagram of {} bytes", payload_len))
            })?;
            ip_header[2..4].copy_from_slice(&total.to_be_bytes());
            // don't fragment, offset 0
            ip_header[6] = 0x40;
            ip_header[7] = 0x00;
            Ok(())
        }
        Some(IpVersion::V6) => Err(CaptureError::unsupported("IPv6 fragment reassembly")),
        None => Err(CaptureError::parse("IP reassembly", "IP header not recognised")),
    }
}

/// Identifies the fragments of one IPv4 datagram (RFC 791).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DatagramKey {
    source: [u8; 4],
    destination: [u8; 4],
    protocol: u8,
    identification: u16,
}

#[derive(Debug, Default)]
struct FragmentTracker {
    data: Vec<u8>,
    expected: usize,
    received: usize,
    offsets: BTreeSet<u16>,
    /// Arrival order of the first fragment, for eviction
    sequence: u64,
}

/// Accumulates fragments per datagram until one completes.
///
/// At most [`MAX_PENDING_DATAGRAMS`] incomplete datagrams are kept; the oldest
/// is dropped when a new one would exceed that.
#[derive(Debug, Default)]
pub struct Reassembler {
    trackers: HashMap<DatagramKey, FragmentTracker>,
    next_sequence: u64,
    evicted: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment frame.
    ///
    /// `frame` is the whole link-layer frame; its first `link_len + ip_len` bytes
    /// are headers. Returns the reassembled frame once every byte of the datagram
    /// has been seen, with the headers of the completing fragment and an IP
    /// header rewritten for the full datagram.
    pub fn push(
        &mut self,
        frame: &[u8],
        link_len: usize,
        ip_len: usize,
        info: FragmentInfo,
    ) -> Result<Option<Vec<u8>>> {
        let headers_len = link_len + ip_len;
        let l3 = frame.get(link_len..).unwrap_or_default();
        if ip_version(l3) == Some(IpVersion::V6) {
            return Err(CaptureError::unsupported("IPv6 fragment reassembly"));
        }
        let ipv4 = Ipv4HeaderSlice::from_slice(l3)
            .map_err(|e| CaptureError::parse("IP reassembly", e.to_string()))?;
        let key = DatagramKey {
            source: ipv4.source(),
            destination: ipv4.destination(),
            protocol: ipv4.protocol().0,
            identification: ipv4.identification(),
        };
        let payload = frame.get(headers_len..).ok_or_else(|| {
            CaptureError::parse("IP reassembly", "fragment shorter than its headers")
        })?;

        // a second first fragment means the identification came round again
        if info.offset == 0 && self.trackers.get(&key).is_some_and(|t| t.offsets.contains(&0)) {
            debug!(id = info.identification, "Identification reused, dropping stale fragments");
            self.trackers.remove(&key);
            self.evicted += 1;
        }
        if !self.trackers.contains_key(&key) {
            self.make_room();
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            self.trackers.insert(key, FragmentTracker { sequence, ..FragmentTracker::default() });
        }
        let Some(tracker) = self.trackers.get_mut(&key) else {
            return Ok(None);
        };

        if !tracker.offsets.insert(info.offset) {
            debug!(id = info.identification, offset = info.offset, "Duplicate fragment ignored");
            return Ok(None);
        }

        let start = headers_len + info.byte_offset();
        let end = start + payload.len();
        if tracker.data.len() < end {
            tracker.data.resize(end, 0);
        }
        tracker.data[start..end].copy_from_slice(payload);
        tracker.received += payload.len();
        if !info.more_fragments {
            tracker.expected = info.byte_offset() + payload.len();
        }

        trace!(
            id = info.identification,
            offset = info.byte_offset(),
            received = tracker.received,
            expected = tracker.expected,
            "Fragment accumulated"
        );

        if tracker.expected == 0 || tracker.received < tracker.expected {
            return Ok(None);
        }

        let Some(mut tracker) = self.trackers.remove(&key) else {
            return Ok(None);
        };
        let expected = tracker.expected;
        tracker.data.resize(headers_len + expected, 0);
        tracker.data[..headers_len].copy_from_slice(&frame[..headers_len]);
        rebuild_reassembled_header(&mut tracker.data[link_len..headers_len], expected)?;
        Ok(Some(tracker.data))
    }

    /// Drop the oldest partial datagram while the table is full.
    fn make_room(&mut self) {
        while self.trackers.len() >= MAX_PENDING_DATAGRAMS {
            let Some(oldest) = self.trackers.iter().min_by_key(|(_, t)| t.sequence).map(|(key, _)| *key) else {
                return;
            };
            trace!(id = oldest.identification, "Giving up on incomplete datagram");
            self.trackers.remove(&oldest);
            self.evicted += 1;
        }
    }

    /// Number of datagrams still waiting for fragments.
    pub fn pending(&self) -> usize {
        self.trackers.len()
    }

    /// Incomplete datagrams given up so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Forget every partial datagram.
    pub fn clear(&mut self) {
        self.trackers.clear();
    }
}
