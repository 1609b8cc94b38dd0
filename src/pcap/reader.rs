//! Capture file reader with IP fragment reassembly
//!
//! Reads the records of a pcap capture in file order and yields one
//! [`CaptureRecord`] per UDP datagram. Fragmented IPv4 datagrams are reassembled
//! unless reassembly is disabled, in which case fragments come back verbatim.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use lidarcap::pcap::{CaptureReader, PacketFilter};
//!
//! fn count_datagrams() -> lidarcap::Result<()> {
//!     let mut reader = CaptureReader::open("drive.pcap", PacketFilter::Udp, true)?;
//!     let start = reader.position();
//!
//!     let mut count = 0;
//!     while let Some(record) = reader.next_packet()? {
//!         count += 1;
//!         println!("{} bytes at t={:.6}", record.payload().len(), record.network_time());
//!     }
//!
//!     // rewind and read again
//!     reader.set_position(start)?;
//!     println!("{} datagrams", count);
//!     Ok(())
//! }
//! ```

use super::filter::PacketFilter;
use super::format::{self, CaptureHeader, LinkType, MAX_RECORD_SIZE, RECORD_HEADER_SIZE};
use super::ip::{self, IPPROTO_UDP, Reassembler, UDP_HEADER_LEN};
use crate::types::{CaptureTimestamp, RawPacket};
use crate::{CaptureError, Result};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Bytes pulled from the source per refill.
const READ_CHUNK: usize = 64 * 1024;

/// Opaque cursor into a capture file.
///
/// Only positions handed out by [`CaptureReader::position`] are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CapturePosition(u64);

impl CapturePosition {
    pub fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Byte offset of the next record, for diagnostics.
    pub fn offset(&self) -> u64 {
        self.0
    }
}

/// One datagram read from a capture, with its link-layer frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    pub timestamp: CaptureTimestamp,
    /// Link-layer frame, reassembled when reassembly is enabled
    pub frame: Vec<u8>,
    /// Original wire length from the record header
    pub original_len: u32,
    /// Offset of the payload inside `frame`
    pub payload_offset: usize,
}

impl CaptureRecord {
    /// Payload after link, IP and UDP headers.
    pub fn payload(&self) -> &[u8] {
        self.frame.get(self.payload_offset..).unwrap_or_default()
    }

    /// Capture time in seconds since the epoch.
    pub fn network_time(&self) -> f64 {
        self.timestamp.as_secs_f64()
    }

    pub fn into_raw_packet(self) -> RawPacket {
        let timestamp = self.network_time();
        let mut data = self.frame;
        data.drain(..self.payload_offset.min(data.len()));
        RawPacket::new(data, timestamp)
    }
}

/// A record exactly as stored in the capture, before filtering or reassembly.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub timestamp: CaptureTimestamp,
    pub frame: Vec<u8>,
    pub original_len: u32,
}

/// Sequential reader over a capture container.
///
/// Records are decoded by `pcap_parser` out of an internal buffer; the reader
/// itself only tracks the file offset of that buffer so it can seek.
#[derive(Debug)]
pub struct CaptureReader<R = File> {
    source: R,
    path: PathBuf,
    header: CaptureHeader,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already handed out as records
    consumed: usize,
    filter: PacketFilter,
    reassemble: bool,
    reassembler: Reassembler,
    /// File offset of `buffer[consumed]`
    position: u64,
    skipped: u64,
    raw_tap: Option<Vec<RawRecord>>,
}

impl CaptureReader {
    /// Open a capture file.
    ///
    /// Fails with a `File` error when the file cannot be opened and with a
    /// `Parse` or `UnsupportedLinkType` error when it is not a usable capture.
    pub fn open<P: AsRef<Path>>(path: P, filter: PacketFilter, reassemble: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| CaptureError::file_error(path, e))?;
        let mut reader = Self::from_reader(file, filter, reassemble)?;
        reader.path = path.to_path_buf();
        debug!(path = %path.display(), filter = %filter, reassemble, "Opened capture");
        Ok(reader)
    }
}

impl<R: Read + Seek> CaptureReader<R> {
    /// Wrap any seekable byte source (used for in-memory captures).
    pub fn from_reader(mut source: R, filter: PacketFilter, reassemble: bool) -> Result<Self> {
        let start = source.stream_position()?;
        let mut buffer = Vec::with_capacity(READ_CHUNK);
        let header = loop {
            if let Some(header) = CaptureHeader::parse(&buffer)? {
                break header;
            }
            if fill(&mut source, &mut buffer)? == 0 {
                return Err(CaptureError::parse(
                    "capture global header",
                    format!("Failed to read {} header bytes", format::GLOBAL_HEADER_SIZE),
                ));
            }
        };
        Ok(Self {
            source,
            path: PathBuf::from("<memory>"),
            header,
            buffer,
            consumed: format::GLOBAL_HEADER_SIZE,
            filter,
            reassemble,
            reassembler: Reassembler::new(),
            position: start + format::GLOBAL_HEADER_SIZE as u64,
            skipped: 0,
            raw_tap: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn link_type(&self) -> LinkType {
        self.header.link_type
    }

    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    pub fn filter(&self) -> PacketFilter {
        self.filter
    }

    pub fn reassembles(&self) -> bool {
        self.reassemble
    }

    /// Number of raw frames skipped so far (bad IP header, unsupported fragments).
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Cursor pointing at the next unread record.
    pub fn position(&self) -> CapturePosition {
        CapturePosition(self.position)
    }

    /// Move the cursor; partially reassembled datagrams are discarded.
    pub fn set_position(&mut self, position: CapturePosition) -> Result<()> {
        self.source.seek(SeekFrom::Start(position.0)).map_err(|e| CaptureError::file_error(&self.path, e))?;
        self.buffer.clear();
        self.consumed = 0;
        self.position = position.0;
        self.reassembler.clear();
        Ok(())
    }

    /// Keep a copy of every record read from now on, whatever the filter says.
    ///
    /// Used to re-emit a range of the capture with its original fragmentation.
    pub fn enable_raw_tap(&mut self) {
        self.raw_tap.get_or_insert_with(Vec::new);
    }

    pub fn disable_raw_tap(&mut self) {
        self.raw_tap = None;
    }

    /// Records read since the last call, in file order.
    pub fn take_raw_records(&mut self) -> Vec<RawRecord> {
        self.raw_tap.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Read the next datagram that passes the filter.
    ///
    /// Returns `Ok(None)` at the end of the capture. A truncated final record
    /// also ends the capture, with a warning.
    pub fn next_packet(&mut self) -> Result<Option<CaptureRecord>> {
        let link_len = self.header.link_type.header_len();

        loop {
            let Some(record) = self.read_record()? else {
                return Ok(None);
            };
            let mut frame = record.frame;

            let l3 = frame.get(link_len..).unwrap_or_default();
            let ip_len = ip::header_length(l3);
            if ip_len == 0 {
                trace!(offset = self.position, "Skipping frame without a usable IP header");
                self.skipped += 1;
                continue;
            }
            let info = ip::fragment_info(l3).unwrap_or_default();
            let mut original_len = record.original_len;

            if info.is_fragment() {
                if self.reassemble {
                    match self.reassembler.push(&frame, link_len, ip_len, info) {
                        Ok(Some(reassembled)) => {
                            frame = reassembled;
                            original_len = frame.len() as u32;
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("Skipping fragment {}: {}", info.identification, e);
                            self.skipped += 1;
                            continue;
                        }
                    }
                } else if info.offset > 0 {
                    // non-first fragment: no transport header to look at
                    if !self.filter.matches_fragment(l3) {
                        continue;
                    }
                    return Ok(Some(CaptureRecord {
                        timestamp: record.timestamp,
                        frame,
                        original_len,
                        payload_offset: link_len + ip_len,
                    }));
                }
            }

            let l3 = &frame[link_len..];
            if !self.filter.matches_datagram(l3, ip_len) {
                continue;
            }
            let transport_len =
                if ip::transport_protocol(l3) == Some(IPPROTO_UDP) { UDP_HEADER_LEN } else { 0 };
            let payload_offset = link_len + ip_len + transport_len;
            if payload_offset > frame.len() {
                trace!(offset = self.position, "Skipping truncated datagram");
                self.skipped += 1;
                continue;
            }

            return Ok(Some(CaptureRecord {
                timestamp: record.timestamp,
                frame,
                original_len,
                payload_offset,
            }));
        }
    }

    /// Read one raw record, cropped to its usable length.
    fn read_record(&mut self) -> Result<Option<RawRecord>> {
        loop {
            let pending = &self.buffer[self.consumed..];
            let parsed = match self.header.parse_record(pending) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(offset = self.position, "Corrupted record: {}", e);
                    return Err(e);
                }
            };

            if let Some((size, block)) = parsed {
                let record = RawRecord {
                    timestamp: self.header.timestamp(block.ts_sec, block.ts_usec),
                    frame: block.data[..format::frame_len(&block)].to_vec(),
                    original_len: block.origlen,
                };
                self.consumed += size;
                self.position += size as u64;
                if let Some(tap) = self.raw_tap.as_mut() {
                    tap.push(record.clone());
                }
                return Ok(Some(record));
            }

            if pending.len() > RECORD_HEADER_SIZE + MAX_RECORD_SIZE as usize {
                return Err(CaptureError::parse(
                    "capture record",
                    format!("record at offset {} exceeds {} bytes", self.position, MAX_RECORD_SIZE),
                ));
            }
            let remaining = pending.len();
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
            if fill(&mut self.source, &mut self.buffer).map_err(|e| CaptureError::file_error(&self.path, e))? == 0 {
                if remaining > 0 {
                    warn!(offset = self.position, bytes = remaining, "Truncated record at end of capture");
                }
                return Ok(None);
            }
        }
    }
}

/// Append up to [`READ_CHUNK`] bytes from `source`, returning the count.
fn fill<R: Read>(source: &mut R, buffer: &mut Vec<u8>) -> std::io::Result<usize> {
    let start = buffer.len();
    buffer.resize(start + READ_CHUNK, 0);
    let result = loop {
        match source.read(&mut buffer[start..]) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => break other,
        }
    };
    let read = *result.as_ref().unwrap_or(&0);
    buffer.truncate(start + read);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcap::CaptureWriter;
    use crate::test_utils::{fragment_ipv4, ipv4_udp_frame, ipv6_fragment_frame};
    use anyhow::{Context, Result, ensure};
    use std::io::Cursor;

    fn capture_of(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut writer = CaptureWriter::from_writer(Vec::new(), LinkType::Ethernet).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            writer.write_frame(frame, CaptureTimestamp::new(1000, i as u32 * 10), frame.len() as u32).unwrap();
        }
        writer.into_inner().unwrap()
    }

    #[test]
    fn fragments_are_reassembled_when_requested() -> Result<()> {
        let mut payload = vec![0xAA, 0x55, 0xA5, 0x5A];
        payload.extend(std::iter::repeat_n(3u8, 2996));
        let whole = ipv4_udp_frame(&payload, 2368, 500);
        let mut frames = vec![ipv4_udp_frame(&[1, 2, 3, 4], 2368, 1)];
        frames.extend(fragment_ipv4(&whole, &[1400, 1400]));

        let bytes = capture_of(&frames);
        let mut reader = CaptureReader::from_reader(Cursor::new(bytes), PacketFilter::Udp, true)?;

        let first = reader.next_packet()?.context("first datagram")?;
        ensure!(first.payload() == [1, 2, 3, 4], "unfragmented payload returned as-is");

        let second = reader.next_packet()?.context("reassembled datagram")?;
        ensure!(second.payload().len() == 3000, "got {} bytes", second.payload().len());
        ensure!(second.payload()[..4] == [0xAA, 0x55, 0xA5, 0x5A], "magic header preserved");
        ensure!(second.original_len as usize == second.frame.len(), "lengths rewritten");
        ensure!(reader.next_packet()?.is_none(), "capture exhausted");
        Ok(())
    }

    #[test]
    fn fragments_pass_through_without_reassembly() -> Result<()> {
        let whole = ipv4_udp_frame(&vec![9u8; 2000], 2368, 42);
        let frames = fragment_ipv4(&whole, &[1400]);
        let bytes = capture_of(&frames);

        let mut reader = CaptureReader::from_reader(Cursor::new(bytes), PacketFilter::UdpPort(2368), false)?;
        let mut seen = Vec::new();
        while let Some(record) = reader.next_packet()? {
            seen.push(record.frame);
        }
        ensure!(seen == frames, "both fragments returned verbatim");
        Ok(())
    }

    #[test]
    fn positions_allow_rereading() -> Result<()> {
        let frames: Vec<_> = (0..5u8).map(|i| ipv4_udp_frame(&[i; 8], 2368, i as u16)).collect();
        let bytes = capture_of(&frames);
        let mut reader = CaptureReader::from_reader(Cursor::new(bytes), PacketFilter::All, true)?;

        reader.next_packet()?.context("packet 0")?;
        let third = reader.position();
        reader.next_packet()?.context("packet 1")?;
        let payload = reader.next_packet()?.context("packet 2")?.payload().to_vec();

        reader.set_position(third)?;
        let again = reader.next_packet()?.context("packet 1 again")?;
        ensure!(again.payload() == [1u8; 8], "seek lands on packet 1");
        let again = reader.next_packet()?.context("packet 2 again")?;
        ensure!(again.payload() == payload.as_slice(), "sequence continues after seek");
        Ok(())
    }

    #[test]
    fn reads_and_seeks_across_buffer_refills() -> Result<()> {
        // roughly four read chunks worth of records
        let frames: Vec<_> = (0..250u16).map(|i| ipv4_udp_frame(&[(i % 256) as u8; 1000], 2368, i)).collect();
        let bytes = capture_of(&frames);
        let mut reader = CaptureReader::from_reader(Cursor::new(bytes), PacketFilter::Udp, false)?;

        let mut positions = Vec::new();
        loop {
            let position = reader.position();
            let Some(record) = reader.next_packet()? else { break };
            ensure!(record.frame == frames[positions.len()], "record {} intact", positions.len());
            positions.push(position);
        }
        ensure!(positions.len() == frames.len());

        for index in [200, 3, 249, 120] {
            reader.set_position(positions[index])?;
            let record = reader.next_packet()?.context("record after seek")?;
            ensure!(record.frame == frames[index], "seek to {} lands on its record", index);
        }
        Ok(())
    }

    #[test]
    fn ipv6_fragments_are_skipped_not_fatal() -> Result<()> {
        let frames = vec![ipv6_fragment_frame(&[0u8; 64], 7, 0, true), ipv4_udp_frame(&[5u8; 4], 2368, 2)];
        let bytes = capture_of(&frames);
        let mut reader = CaptureReader::from_reader(Cursor::new(bytes), PacketFilter::Udp, true)?;

        let record = reader.next_packet()?.context("IPv4 packet after the IPv6 fragment")?;
        ensure!(record.payload() == [5u8; 4]);
        ensure!(reader.skipped() == 1, "IPv6 fragment counted as skipped");
        Ok(())
    }

    #[test]
    fn truncated_capture_ends_cleanly() -> Result<()> {
        let frames = vec![ipv4_udp_frame(&[1u8; 32], 2368, 1), ipv4_udp_frame(&[2u8; 32], 2368, 2)];
        let mut bytes = capture_of(&frames);
        bytes.truncate(bytes.len() - 10);

        let mut reader = CaptureReader::from_reader(Cursor::new(bytes), PacketFilter::Udp, true)?;
        ensure!(reader.next_packet()?.is_some());
        ensure!(reader.next_packet()?.is_none());
        Ok(())
    }

    #[test]
    fn raw_tap_sees_filtered_and_fragmented_records() -> Result<()> {
        let whole = ipv4_udp_frame(&vec![7u8; 2000], 2368, 9);
        let mut frames = vec![ipv4_udp_frame(&[1u8; 8], 9999, 1)];
        frames.extend(fragment_ipv4(&whole, &[1400]));
        let bytes = capture_of(&frames);

        let mut reader = CaptureReader::from_reader(Cursor::new(bytes), PacketFilter::UdpPort(2368), true)?;
        reader.enable_raw_tap();
        let record = reader.next_packet()?.context("reassembled datagram")?;
        ensure!(record.payload().len() == 2000);

        let raw: Vec<Vec<u8>> = reader.take_raw_records().into_iter().map(|r| r.frame).collect();
        ensure!(raw == frames, "filtered datagram and both fragments tapped");
        ensure!(reader.take_raw_records().is_empty());
        Ok(())
    }

    #[test]
    fn missing_file_reports_not_found() {
        let err = match CaptureReader::open("/definitely/not/here.pcap", PacketFilter::Udp, true) {
            Err(e) => e,
            Ok(_) => panic!("opening a missing file must fail"),
        };
        assert!(err.is_not_found());
    }
}
