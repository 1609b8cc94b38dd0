//! Random-access frames from a capture file
//!
//! Opening a capture runs one pass over it to build a [`CaptureFrameIndex`]:
//! the file position and start times of every frame boundary, plus the
//! boundary state the interpreter needs to resume from there. Any frame can
//! then be decoded by seeking to its entry, without re-reading the file from
//! the start.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use lidarcap::config::FileSourceConfig;
//! use lidarcap::interpreter::AsensingInterpreter;
//! use lidarcap::providers::{FileFrameSource, TimeBasis};
//!
//! fn scrub() -> lidarcap::Result<()> {
//!     let config = FileSourceConfig {
//!         calibration_file: Some("A0-No-Correction.json".into()),
//!         lidar_port: Some(51180),
//!         ..FileSourceConfig::default()
//!     };
//!     let mut source = FileFrameSource::open("drive.pcap", AsensingInterpreter::default(), config)?;
//!     println!("{} frames", source.frame_count());
//!
//!     let index = source.get_frame_index_for_time(1_700_000_010.0, TimeBasis::Network)?;
//!     let frame = source.get_frame(index)?;
//!     println!("frame {} has {} points", index, frame.len());
//!
//!     source.save_frame_range("excerpt.pcap", index, index + 2)?;
//!     Ok(())
//! }
//! ```

use crate::config::FileSourceConfig;
use crate::interpreter::{FrameInformation, FramingMethod, Interpreter};
use crate::pcap::{CapturePosition, CaptureReader, CaptureWriter, PacketFilter};
use crate::types::Frame;
use crate::{CaptureError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Which clock a time lookup refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeBasis {
    /// Capture timestamps
    #[default]
    Network,
    /// Sensor timestamps decoded from the payload
    Data,
}

/// Outcome of the last catalog pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogStatus {
    /// No lidar packet in the capture
    Empty,
    /// Lidar packets were seen but no boundary was ever found
    Unparsed,
    Ready,
}

/// Frame boundaries of one capture, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrameIndex<B> {
    entries: Vec<FrameInformation<B>>,
    timeshift: f64,
}

impl<B> Default for CaptureFrameIndex<B> {
    fn default() -> Self {
        Self { entries: Vec::new(), timeshift: 0.0 }
    }
}

impl<B> CaptureFrameIndex<B> {
    pub fn new(entries: Vec<FrameInformation<B>>) -> Self {
        let timeshift = median(entries.iter().map(|e| e.first_packet_data_time - e.first_packet_network_time));
        Self { entries, timeshift }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FrameInformation<B>> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[FrameInformation<B>] {
        &self.entries
    }

    /// Median of `data time - network time` over all entries.
    pub fn timeshift(&self) -> f64 {
        self.timeshift
    }

    pub fn status(&self) -> CatalogStatus {
        match self.entries.len() {
            0 => CatalogStatus::Empty,
            1 => CatalogStatus::Unparsed,
            _ => CatalogStatus::Ready,
        }
    }

    /// Start time of entry `index` on the given clock.
    pub fn start_time(&self, index: usize, basis: TimeBasis) -> Option<f64> {
        let entry = self.entries.get(index)?;
        Some(match basis {
            TimeBasis::Network => entry.first_packet_network_time,
            TimeBasis::Data => entry.first_packet_data_time,
        })
    }

    /// Index of the first frame starting at or after `time`.
    pub fn index_for_time(&self, time: f64, basis: TimeBasis) -> Result<usize> {
        let index = self.entries.partition_point(|entry| {
            let start = match basis {
                TimeBasis::Network => entry.first_packet_network_time,
                TimeBasis::Data => entry.first_packet_data_time,
            };
            start < time
        });
        if index < self.entries.len() {
            Ok(index)
        } else {
            Err(CaptureError::out_of_range(format!("frame at time {:.6}", time), index, self.entries.len()))
        }
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut values: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    values[values.len() / 2]
}

/// Random-access frame reader over one capture file.
#[derive(Debug)]
pub struct FileFrameSource<I: Interpreter> {
    config: FileSourceConfig,
    reader: CaptureReader,
    interpreter: I,
    index: CaptureFrameIndex<I::Boundary>,
}

impl<I: Interpreter> FileFrameSource<I> {
    /// Open a capture, load the configured calibration and build the frame index.
    pub fn open<P: AsRef<Path>>(path: P, mut interpreter: I, config: FileSourceConfig) -> Result<Self> {
        config.interpreter.validate()?;
        let path = path.as_ref();
        let reader = CaptureReader::open(path, PacketFilter::udp_port(config.lidar_port), config.reassemble)?;

        interpreter.core_mut().set_config(config.interpreter.clone());
        if let Some(calibration) = &config.calibration_file {
            interpreter.load_calibration(calibration)?;
        }

        let mut source = Self { config, reader, interpreter, index: CaptureFrameIndex::default() };
        source.read_frame_information()?;
        info!(
            path = %path.display(),
            frames = source.index.len(),
            timeshift = source.index.timeshift(),
            sensor = %source.interpreter.sensor_information(),
            "Opened capture for replay"
        );
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    pub fn config(&self) -> &FileSourceConfig {
        &self.config
    }

    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }

    pub fn interpreter_mut(&mut self) -> &mut I {
        &mut self.interpreter
    }

    pub fn index(&self) -> &CaptureFrameIndex<I::Boundary> {
        &self.index
    }

    pub fn catalog_status(&self) -> CatalogStatus {
        self.index.status()
    }

    /// Number of entries in the frame index, hidden frames included.
    pub fn frame_count(&self) -> usize {
        self.index.len()
    }

    /// Rebuild the frame index with one pass over the capture.
    pub fn read_frame_information(&mut self) -> Result<CatalogStatus> {
        self.interpreter.reset_parser_metadata();
        let start = CapturePosition::default();
        self.reader.set_position(start)?;

        let interpreter_framing = self.interpreter.framing_method() == FramingMethod::Interpreter;
        let mut entries: Vec<FrameInformation<I::Boundary>> = Vec::new();
        let mut lidar_packets = 0u64;
        loop {
            let position = self.reader.position();
            let Some(record) = self.reader.next_packet()? else {
                break;
            };
            let payload = record.payload();
            if !self.interpreter.is_lidar_packet(payload) {
                continue;
            }
            lidar_packets += 1;
            let network_time = record.network_time();

            // the partial frame before the first boundary gets an entry too
            let first = entries.is_empty() && interpreter_framing;
            if first {
                entries.push(FrameInformation {
                    file_position: position,
                    first_packet_network_time: network_time,
                    first_packet_data_time: network_time,
                    specific: I::Boundary::default(),
                });
            }
            self.interpreter.pre_process_wrapped(payload, position, network_time, Some(&mut entries));
            if first {
                let data_time = self.interpreter.core().parser_metadata().first_packet_data_time;
                if data_time != 0.0 {
                    entries[0].first_packet_data_time = data_time;
                }
            }
        }

        self.index = CaptureFrameIndex::new(entries);
        let status = self.index.status();
        match status {
            CatalogStatus::Empty => warn!(path = %self.path().display(), "No lidar packet found in capture"),
            CatalogStatus::Unparsed => warn!(
                path = %self.path().display(),
                lidar_packets,
                "Could not parse frames: no frame boundary found"
            ),
            CatalogStatus::Ready => {}
        }
        info!(
            frames = self.index.len(),
            lidar_packets,
            skipped = self.reader.skipped(),
            timeshift = self.index.timeshift(),
            "Built capture index"
        );
        Ok(status)
    }

    fn hides_first_and_last(&self) -> bool {
        !self.config.show_first_and_last_frame && self.index.len() >= 3
    }

    /// Display times of the visible frames.
    ///
    /// Sensor time when `use_packet_time_for_display` is set, otherwise capture
    /// time plus `time_offset_s`.
    pub fn timesteps(&self) -> Vec<f64> {
        let offset = self.config.interpreter.time_offset_s;
        let times = self.index.entries().iter().map(|entry| {
            if self.config.use_packet_time_for_display {
                entry.first_packet_data_time
            } else {
                entry.first_packet_network_time + offset
            }
        });
        let mut times: Vec<f64> = times.collect();
        if self.hides_first_and_last() {
            times.pop();
            times.remove(0);
        }
        times
    }

    /// First and last display time, if any frame is visible.
    pub fn time_range(&self) -> Option<(f64, f64)> {
        let times = self.timesteps();
        Some((*times.first()?, *times.last()?))
    }

    pub fn get_frame_index_for_time(&self, time: f64, basis: TimeBasis) -> Result<usize> {
        self.index.index_for_time(time, basis)
    }

    pub fn get_frame_index_for_network_time(&self, time: f64) -> Result<usize> {
        self.get_frame_index_for_time(time, TimeBasis::Network)
    }

    pub fn get_frame_index_for_data_time(&self, time: f64) -> Result<usize> {
        self.get_frame_index_for_time(time, TimeBasis::Data)
    }

    /// Decode frame `index` of the frame index.
    ///
    /// The last frame of the capture is sealed at end of file.
    pub fn get_frame(&mut self, index: usize) -> Result<Arc<Frame>> {
        let entry = self
            .index
            .get(index)
            .cloned()
            .ok_or_else(|| CaptureError::out_of_range("frame", index, self.index.len()))?;
        self.interpreter.ensure_calibrated()?;

        self.interpreter.reset_current_frame();
        self.interpreter.clear_all_frames_available();
        self.interpreter.set_parser_metadata(entry.clone());
        self.reader.set_position(entry.file_position)?;

        let mut packets = 0u32;
        while let Some(record) = self.reader.next_packet()? {
            let payload = record.payload();
            if !self.interpreter.is_lidar_packet(payload) {
                continue;
            }
            packets += 1;
            self.interpreter.process_packet_wrapped(payload, record.network_time());
            if let Some(frame) = self.interpreter.take_last_frame() {
                trace!(index, packets, points = frame.len(), "Frame decoded");
                return Ok(frame);
            }
        }

        debug!(index, packets, "Reached end of capture, sealing last frame");
        let method = self.interpreter.framing_method();
        self.interpreter.split_frame(true, method);
        self.interpreter
            .take_last_frame()
            .ok_or_else(|| CaptureError::State { reason: format!("frame {} could not be sealed", index) })
    }

    /// Decode the frame displayed at `time`.
    pub fn get_frame_at_time(&mut self, time: f64, basis: TimeBasis) -> Result<Arc<Frame>> {
        let index = self.get_frame_index_for_time(time, basis)?;
        self.get_frame(index)
    }

    /// Copy the records of frames `start..=end` to a new capture file.
    ///
    /// Indices are display indices: they are shifted past the hidden first
    /// frame when first and last frames are hidden. Every record of the range
    /// is written as stored, non-lidar traffic and fragments included. Only
    /// available with interpreter framing. Returns the number of records written.
    pub fn save_frame_range<P: AsRef<Path>>(&mut self, path: P, start: usize, end: usize) -> Result<u64> {
        if self.interpreter.framing_method() != FramingMethod::Interpreter {
            return Err(CaptureError::config("saving frames needs interpreter framing"));
        }
        let shift = usize::from(self.hides_first_and_last());
        let (start, end) = (start + shift, end + shift);
        if start > end || end >= self.index.len() {
            return Err(CaptureError::out_of_range("frame", end, self.index.len()));
        }

        let path = path.as_ref();
        let mut writer = CaptureWriter::create(path, self.reader.link_type())?;
        let stored = self.interpreter.parser_metadata();

        let result = self.copy_frames(&mut writer, start, end);
        self.reader.disable_raw_tap();
        self.interpreter.set_parser_metadata(stored);
        result?;

        writer.flush()?;
        info!(path = %path.display(), start, end, records = writer.records_written(), "Saved frame range");
        Ok(writer.records_written())
    }

    fn copy_frames(&mut self, writer: &mut CaptureWriter, start: usize, end: usize) -> Result<()> {
        let entry = self.index.entries()[start].clone();
        self.reader.set_position(entry.file_position)?;
        self.interpreter.set_parser_metadata(entry);
        self.reader.enable_raw_tap();

        let mut current = start;
        loop {
            let next = self.reader.next_packet()?;
            let raw = self.reader.take_raw_records();
            if let Some(record) = &next {
                let payload = record.payload();
                if self.interpreter.is_lidar_packet(payload)
                    && self.interpreter.pre_process_wrapped(
                        payload,
                        CapturePosition::default(),
                        record.network_time(),
                        None,
                    )
                {
                    current += 1;
                    if current > end {
                        return Ok(());
                    }
                }
            }
            for record in &raw {
                writer.write_frame(&record.frame, record.timestamp, record.original_len)?;
            }
            if next.is_none() {
                return Ok(());
            }
        }
    }

    /// Load a new calibration and rebuild the frame index.
    pub fn set_calibration_file(&mut self, path: PathBuf) -> Result<()> {
        let loaded = self.interpreter.load_calibration(&path);
        self.config.calibration_file = Some(path);
        loaded?;
        self.read_frame_information()?;
        Ok(())
    }

    /// Restrict decoding to one UDP port (or all UDP) and rebuild the frame index.
    pub fn set_lidar_port(&mut self, port: Option<u16>) -> Result<()> {
        if self.config.lidar_port == port {
            return Ok(());
        }
        self.config.lidar_port = port;
        self.reopen()
    }

    pub fn set_reassemble(&mut self, reassemble: bool) -> Result<()> {
        if self.config.reassemble == reassemble {
            return Ok(());
        }
        self.config.reassemble = reassemble;
        self.reopen()
    }

    fn reopen(&mut self) -> Result<()> {
        let path = self.path().to_path_buf();
        self.reader = CaptureReader::open(&path, PacketFilter::udp_port(self.config.lidar_port), self.config.reassemble)?;
        self.read_frame_information()?;
        Ok(())
    }

    /// Change the framing method; the frame index depends on it and is rebuilt.
    pub fn set_framing_method(&mut self, method: FramingMethod) -> Result<()> {
        self.config.interpreter.framing_method = method;
        self.config.interpreter.validate()?;
        self.interpreter.set_framing_method(method);
        self.read_frame_information()?;
        Ok(())
    }

    pub fn set_show_first_and_last_frame(&mut self, show: bool) {
        self.config.show_first_and_last_frame = show;
    }

    pub fn set_use_packet_time_for_display(&mut self, use_packet_time: bool) {
        self.config.use_packet_time_for_display = use_packet_time;
    }
}
