//! Capture container structures
//!
//! Binary layout of the classic pcap container, bit compatible with the files
//! written by tcpdump and Wireshark:
//!
//! 1. **Global Header** (24 bytes) - magic, version, snap length and link type
//! 2. **Record Header** (16 bytes) - timestamp, captured length and original length
//! 3. **Record Data** - `captured_length` bytes of link-layer frame
//!
//! Records 2 and 3 repeat until the end of the file. Reading goes through
//! `pcap_parser`, which understands both byte orders and both timestamp
//! resolutions. Writing always produces little-endian microsecond files.

use crate::types::CaptureTimestamp;
use crate::{CaptureError, Result};
use pcap_parser::{LegacyPcapBlock, Linktype, PcapHeader, parse_pcap_frame, parse_pcap_frame_be, parse_pcap_header};
use std::io::Write;
use tracing::debug;

pub const GLOBAL_HEADER_SIZE: usize = 24;
pub const RECORD_HEADER_SIZE: usize = 16;

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;

/// Snap length written into new captures.
pub const DEFAULT_SNAPLEN: u32 = 65_535;

/// Largest record we accept before declaring the file corrupted.
pub const MAX_RECORD_SIZE: u32 = 256 * 1024;

/// Link layer of every record in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// BSD loopback encapsulation (DLT_NULL), 4-byte family header
    Null,
    /// Ethernet II (DLT_EN10MB), 14-byte header
    Ethernet,
}

impl LinkType {
    pub fn from_linktype(linktype: Linktype) -> Result<Self> {
        if linktype == Linktype::NULL {
            Ok(LinkType::Null)
        } else if linktype == Linktype::ETHERNET {
            Ok(LinkType::Ethernet)
        } else {
            Err(CaptureError::UnsupportedLinkType { link_type: linktype.0 as u32 })
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            LinkType::Null => 0,
            LinkType::Ethernet => 1,
        }
    }

    /// Length of the link-layer header preceding the IP header.
    pub fn header_len(self) -> usize {
        match self {
            LinkType::Null => 4,
            LinkType::Ethernet => 14,
        }
    }
}

/// Global header of a capture being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureHeader {
    pub big_endian: bool,
    pub nanosecond_precision: bool,
    pub version_major: u16,
    pub version_minor: u16,
    pub snaplen: u32,
    pub link_type: LinkType,
}

impl CaptureHeader {
    /// Parse the global header at the start of `input`.
    ///
    /// Returns `Ok(None)` when `input` is too short to hold it.
    pub fn parse(input: &[u8]) -> Result<Option<Self>> {
        let header = match parse_pcap_header(input) {
            Ok((_, header)) => header,
            Err(e) if e.is_incomplete() => return Ok(None),
            Err(e) => return Err(CaptureError::parse("capture global header", e.to_string())),
        };
        Self::from_pcap_header(&header).map(Some)
    }

    fn from_pcap_header(header: &PcapHeader) -> Result<Self> {
        let link_type = LinkType::from_linktype(header.network)?;
        debug!(
            "Parsed capture header: version={}.{}, snaplen={}, link_type={:?}, big_endian={}",
            header.version_major,
            header.version_minor,
            header.snaplen,
            link_type,
            header.is_bigendian()
        );
        Ok(Self {
            big_endian: header.is_bigendian(),
            nanosecond_precision: header.is_nanosecond_precision(),
            version_major: header.version_major,
            version_minor: header.version_minor,
            snaplen: header.snaplen,
            link_type,
        })
    }

    /// Parse the record at the start of `input`, returning it with the number
    /// of bytes it occupies. `Ok(None)` means the record is not complete yet.
    pub fn parse_record<'a>(&self, input: &'a [u8]) -> Result<Option<(usize, LegacyPcapBlock<'a>)>> {
        let parsed = if self.big_endian { parse_pcap_frame_be(input) } else { parse_pcap_frame(input) };
        match parsed {
            Ok((rest, block)) => Ok(Some((input.len() - rest.len(), block))),
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => Err(CaptureError::parse("capture record", e.to_string())),
        }
    }

    /// Record timestamp, with nanosecond captures cut down to microseconds.
    pub fn timestamp(&self, secs: u32, fraction: u32) -> CaptureTimestamp {
        let micros = if self.nanosecond_precision { fraction / 1_000 } else { fraction };
        CaptureTimestamp::new(secs, micros)
    }
}

/// Usable length of a record, cropped to whichever of the two lengths is smaller.
pub fn frame_len(block: &LegacyPcapBlock<'_>) -> usize {
    (block.caplen.min(block.origlen) as usize).min(block.data.len())
}

/// Write a little-endian, microsecond global header.
pub fn write_global_header<W: Write>(writer: &mut W, link_type: LinkType) -> std::io::Result<()> {
    let mut bytes = [0u8; GLOBAL_HEADER_SIZE];
    bytes[0..4].copy_from_slice(&MAGIC_MICROS.to_le_bytes());
    bytes[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
    bytes[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
    // thiszone and sigfigs stay zero
    bytes[16..20].copy_from_slice(&DEFAULT_SNAPLEN.to_le_bytes());
    bytes[20..24].copy_from_slice(&link_type.raw().to_le_bytes());
    writer.write_all(&bytes)
}

pub fn write_record_header<W: Write>(
    writer: &mut W,
    timestamp: CaptureTimestamp,
    captured_len: u32,
    original_len: u32,
) -> std::io::Result<()> {
    let mut bytes = [0u8; RECORD_HEADER_SIZE];
    bytes[0..4].copy_from_slice(&timestamp.secs.to_le_bytes());
    bytes[4..8].copy_from_slice(&timestamp.micros.to_le_bytes());
    bytes[8..12].copy_from_slice(&captured_len.to_le_bytes());
    bytes[12..16].copy_from_slice(&original_len.to_le_bytes());
    writer.write_all(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC_NANOS: u32 = 0xa1b2_3c4d;

    #[test]
    fn written_header_is_understood() {
        let mut bytes = Vec::new();
        write_global_header(&mut bytes, LinkType::Ethernet).unwrap();
        assert_eq!(bytes.len(), GLOBAL_HEADER_SIZE);

        let header = CaptureHeader::parse(&bytes).unwrap().unwrap();
        assert!(!header.big_endian);
        assert!(!header.nanosecond_precision);
        assert_eq!((header.version_major, header.version_minor), (VERSION_MAJOR, VERSION_MINOR));
        assert_eq!(header.snaplen, DEFAULT_SNAPLEN);
        assert_eq!(header.link_type, LinkType::Ethernet);
    }

    #[test]
    fn big_endian_nanosecond_capture_is_understood() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC_NANOS.to_be_bytes());
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&1500u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());

        let header = CaptureHeader::parse(&bytes).unwrap().unwrap();
        assert!(header.big_endian);
        assert!(header.nanosecond_precision);
        assert_eq!(header.link_type, LinkType::Null);

        let mut record = Vec::new();
        record.extend_from_slice(&10u32.to_be_bytes());
        record.extend_from_slice(&500_000_000u32.to_be_bytes());
        record.extend_from_slice(&60u32.to_be_bytes());
        record.extend_from_slice(&80u32.to_be_bytes());
        record.extend_from_slice(&[0x45; 60]);

        let (consumed, block) = header.parse_record(&record).unwrap().unwrap();
        assert_eq!(consumed, RECORD_HEADER_SIZE + 60);
        assert_eq!(header.timestamp(block.ts_sec, block.ts_usec), CaptureTimestamp::new(10, 500_000));
        assert_eq!(frame_len(&block), 60);
        assert_eq!(block.origlen, 80);
    }

    #[test]
    fn partial_record_asks_for_more_bytes() {
        let mut bytes = Vec::new();
        write_global_header(&mut bytes, LinkType::Ethernet).unwrap();
        let header = CaptureHeader::parse(&bytes).unwrap().unwrap();

        let mut record = Vec::new();
        write_record_header(&mut record, CaptureTimestamp::new(1, 2), 100, 100).unwrap();
        record.extend_from_slice(&[0u8; 40]);
        assert!(header.parse_record(&record).unwrap().is_none());
        assert!(CaptureHeader::parse(&bytes[..10]).unwrap().is_none());
    }

    #[test]
    fn unknown_link_type_is_rejected() {
        let mut bytes = Vec::new();
        write_global_header(&mut bytes, LinkType::Ethernet).unwrap();
        bytes[20..24].copy_from_slice(&113u32.to_le_bytes());

        let err = CaptureHeader::parse(&bytes).unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedLinkType { link_type: 113 }));
    }

    #[test]
    fn garbage_magic_is_a_parse_error() {
        let bytes = vec![0x42u8; GLOBAL_HEADER_SIZE];
        let err = CaptureHeader::parse(&bytes).unwrap_err();
        assert!(matches!(err, CaptureError::Parse { .. }));
    }
}
