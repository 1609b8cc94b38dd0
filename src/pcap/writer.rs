//! Capture file writer
//!
//! Produces classic little-endian, microsecond pcap files that any capture tool
//! can open. Used for recording live traffic, exporting frame ranges and
//! dumping the crash-capture ring.

use super::format::{self, DEFAULT_SNAPLEN, LinkType};
use crate::network::UdpPacketBuilder;
use crate::types::CaptureTimestamp;
use crate::{CaptureError, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct CaptureWriter<W: Write = BufWriter<File>> {
    sink: W,
    path: PathBuf,
    link_type: LinkType,
    records_written: u64,
}

impl CaptureWriter {
    /// Create (or truncate) a capture file and write its global header.
    pub fn create<P: AsRef<Path>>(path: P, link_type: LinkType) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| CaptureError::file_error(path, e))?;
        let mut writer = Self::from_writer(BufWriter::new(file), link_type)?;
        writer.path = path.to_path_buf();
        debug!(path = %path.display(), ?link_type, "Created capture file");
        Ok(writer)
    }
}

impl<W: Write> CaptureWriter<W> {
    pub fn from_writer(mut sink: W, link_type: LinkType) -> Result<Self> {
        format::write_global_header(&mut sink, link_type)?;
        Ok(Self { sink, path: PathBuf::from("<memory>"), link_type, records_written: 0 })
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Append one link-layer frame.
    pub fn write_frame(&mut self, frame: &[u8], timestamp: CaptureTimestamp, original_len: u32) -> Result<()> {
        let captured = frame.len().min(DEFAULT_SNAPLEN as usize);
        format::write_record_header(&mut self.sink, timestamp, captured as u32, original_len.max(captured as u32))
            .map_err(|e| CaptureError::file_error(&self.path, e))?;
        self.sink.write_all(&frame[..captured]).map_err(|e| CaptureError::file_error(&self.path, e))?;
        self.records_written += 1;
        Ok(())
    }

    /// Wrap a bare UDP payload in a synthetic frame and append it.
    ///
    /// Only meaningful for Ethernet captures, which is what recordings use.
    pub fn write_udp_payload(
        &mut self,
        builder: &UdpPacketBuilder,
        payload: &[u8],
        timestamp: CaptureTimestamp,
    ) -> Result<()> {
        let frame = builder.build(payload)?;
        let len = frame.len() as u32;
        self.write_frame(&frame, timestamp, len)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush().map_err(|e| CaptureError::file_error(&self.path, e))
    }

    /// Flush and hand back the underlying sink.
    pub fn into_inner(mut self) -> Result<W> {
        self.flush()?;
        Ok(self.sink)
    }
}
