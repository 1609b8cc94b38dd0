//! # Packet interpreters
//!
//! An interpreter turns lidar payloads into point-cloud frames. Each sensor wire
//! format implements the [`Interpreter`] trait; everything format independent
//! (frame storage, framing policy, crop and laser selection, calibration
//! bookkeeping) lives in [`InterpreterCore`] and the trait's provided methods.
//!
//! ## Framing
//!
//! Two framing methods are available, chosen once per source:
//!
//! - [`FramingMethod::Interpreter`]: the decoder seals a frame when the sensor
//!   reports a new frame (frame id change).
//! - [`FramingMethod::NetworkPacketTime`]: a frame is sealed every
//!   `frame_duration_s` seconds of capture time, whatever the payload says.
//!
//! Splits requested by the method that is not selected are ignored unless forced.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use lidarcap::interpreter::{AsensingInterpreter, Interpreter};
//! use lidarcap::config::InterpreterConfig;
//!
//! fn decode(payloads: &[(Vec<u8>, f64)]) -> lidarcap::Result<()> {
//!     let mut interpreter = AsensingInterpreter::new(InterpreterConfig::default());
//!     interpreter.load_calibration("A0-No-Correction.json".as_ref())?;
//!
//!     for (payload, network_time) in payloads {
//!         if !interpreter.is_lidar_packet(payload) {
//!             continue;
//!         }
//!         interpreter.process_packet_wrapped(payload, *network_time);
//!         if let Some(frame) = interpreter.take_last_frame() {
//!             println!("frame with {} points", frame.len());
//!             interpreter.clear_all_frames_available();
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod asensing;
mod crop;

pub use asensing::AsensingInterpreter;
pub use crop::{CropConfig, CropMode};

use crate::config::InterpreterConfig;
use crate::pcap::CapturePosition;
use crate::types::{Frame, Point};
use crate::{CaptureError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Policy deciding where one frame ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMethod {
    /// Boundaries reported by the sensor payload
    #[default]
    Interpreter,
    /// Boundaries every configured duration of capture time
    NetworkPacketTime,
}

/// Metadata of one frame boundary.
///
/// `specific` carries whatever the decoder needs to resume boundary detection
/// from this point, so a catalog entry is enough to decode its frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameInformation<B> {
    pub file_position: CapturePosition,
    pub first_packet_network_time: f64,
    pub first_packet_data_time: f64,
    pub specific: B,
}

/// Format independent interpreter state.
#[derive(Debug)]
pub struct InterpreterCore<B> {
    config: InterpreterConfig,
    frames: Vec<Arc<Frame>>,
    current: Frame,
    parser_metadata: FrameInformation<B>,
    last_time_slot: u64,
    previous_time_slot: u64,
    calibration_file: Option<PathBuf>,
    calibrated: bool,
}

impl<B: Default> InterpreterCore<B> {
    pub fn new(config: InterpreterConfig) -> Self {
        Self {
            config,
            frames: Vec::new(),
            current: Frame::default(),
            parser_metadata: FrameInformation::default(),
            last_time_slot: 0,
            previous_time_slot: 0,
            calibration_file: None,
            calibrated: false,
        }
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: InterpreterConfig) {
        self.config = config;
    }

    pub fn set_crop(&mut self, crop: CropConfig) {
        self.config.crop = crop;
    }

    pub fn set_laser_selection(&mut self, selection: Option<Vec<bool>>) {
        self.config.laser_selection = selection;
    }

    pub fn current_frame(&self) -> &Frame {
        &self.current
    }

    pub fn parser_metadata(&self) -> &FrameInformation<B> {
        &self.parser_metadata
    }

    pub fn parser_metadata_mut(&mut self) -> &mut FrameInformation<B> {
        &mut self.parser_metadata
    }

    pub fn calibration_file(&self) -> Option<&Path> {
        self.calibration_file.as_deref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Record the outcome of a calibration load.
    pub fn set_calibrated(&mut self, path: &Path, calibrated: bool) {
        self.calibration_file = Some(path.to_path_buf());
        self.calibrated = calibrated;
    }

    /// Append a point to the frame being filled, after crop and laser selection.
    ///
    /// Returns false when the point was filtered out.
    pub fn push_point(&mut self, point: Point) -> bool {
        if !self.config.is_laser_selected(point.laser_id as usize) || self.config.crop.should_crop_out(point.position)
        {
            return false;
        }
        self.current.push(point);
        true
    }

    /// Whether the frame being filled reached its reserved size.
    pub fn current_frame_full(&self) -> bool {
        self.current.is_full()
    }
}

/// Capability set of a sensor decoder.
///
/// Implementors provide format validation, decoding, boundary pre-processing and
/// calibration. The provided methods implement framing and frame hand-off on top
/// of them and should not need overriding.
pub trait Interpreter: Send {
    /// Boundary state stored in every catalog entry (for example the last frame id).
    type Boundary: Clone + Default + Debug + Send + 'static;

    fn core(&self) -> &InterpreterCore<Self::Boundary>;

    fn core_mut(&mut self) -> &mut InterpreterCore<Self::Boundary>;

    /// Load a calibration artifact. On failure the interpreter stays uncalibrated.
    fn load_calibration(&mut self, path: &Path) -> Result<()>;

    /// Cheap structural check used to skip foreign traffic.
    fn is_lidar_packet(&self, data: &[u8]) -> bool;

    /// Decode one payload into the current frame, splitting on sensor boundaries.
    fn process_packet(&mut self, data: &[u8]);

    /// Boundary detection from header fields only.
    ///
    /// Pushes a [`FrameInformation`] into `catalog` (when given) and returns true
    /// when the payload starts a new frame.
    fn pre_process_packet(
        &mut self,
        data: &[u8],
        position: CapturePosition,
        network_time: f64,
        catalog: Option<&mut Vec<FrameInformation<Self::Boundary>>>,
    ) -> bool;

    fn sensor_information(&self) -> String;

    /// Points to reserve for a new frame, given the size of the previous one.
    fn frame_capacity(&self, previous_len: usize) -> usize {
        previous_len
    }

    /// Called after the current frame was replaced; resets per-frame counters.
    fn on_new_frame(&mut self) {}

    /// Seal the current frame and start a new one.
    ///
    /// Only honoured when `force` is set or `method` is the configured framing
    /// method. Empty frames are dropped instead of sealed when configured so,
    /// unless forced.
    fn split_frame(&mut self, force: bool, method: FramingMethod) -> bool {
        let core = self.core();
        if !force && method != core.config.framing_method {
            return false;
        }
        if core.current.is_empty() && core.config.ignore_empty_frames && !force {
            return false;
        }

        let capacity = self.frame_capacity(self.core().current.len());
        let core = self.core_mut();
        let sealed = mem::replace(&mut core.current, Frame::with_capacity(capacity));
        trace!(points = sealed.len(), ?method, force, "Frame sealed");
        core.frames.push(Arc::new(sealed));
        self.on_new_frame();
        true
    }

    /// Decode one payload, applying network-time framing first when selected.
    fn process_packet_wrapped(&mut self, data: &[u8], network_time: f64) {
        let config = self.core().config();
        if config.framing_method == FramingMethod::NetworkPacketTime && self.is_lidar_packet(data) {
            let slot = (network_time / config.frame_duration_s) as u64;
            let last = self.core().last_time_slot;
            if last != 0 && slot != last {
                self.split_frame(false, FramingMethod::NetworkPacketTime);
            }
            self.core_mut().last_time_slot = slot;
        }
        self.process_packet(data);
    }

    /// Boundary pre-processing under the configured framing method.
    fn pre_process_wrapped(
        &mut self,
        data: &[u8],
        position: CapturePosition,
        network_time: f64,
        catalog: Option<&mut Vec<FrameInformation<Self::Boundary>>>,
    ) -> bool {
        let InterpreterConfig { framing_method, frame_duration_s, .. } = *self.core().config();
        match framing_method {
            FramingMethod::Interpreter => self.pre_process_packet(data, position, network_time, catalog),
            FramingMethod::NetworkPacketTime => {
                let slot = (network_time / frame_duration_s) as u64;
                if slot == self.core().previous_time_slot {
                    return false;
                }
                let core = self.core_mut();
                core.previous_time_slot = slot;
                if let Some(catalog) = catalog {
                    // no payload time is available without decoding
                    catalog.push(FrameInformation {
                        file_position: position,
                        first_packet_network_time: network_time,
                        first_packet_data_time: network_time,
                        specific: core.parser_metadata.specific.clone(),
                    });
                }
                true
            }
        }
    }

    /// Whether at least one sealed frame is waiting.
    fn is_new_data(&self) -> bool {
        !self.core().frames.is_empty()
    }

    /// Most recently sealed frame.
    fn take_last_frame(&self) -> Option<Arc<Frame>> {
        self.core().frames.last().cloned()
    }

    /// All sealed frames not yet cleared, oldest first.
    fn frames_available(&self) -> &[Arc<Frame>] {
        &self.core().frames
    }

    fn clear_all_frames_available(&mut self) {
        self.core_mut().frames.clear();
    }

    /// Drop the frame being filled and every sealed frame.
    fn reset_current_frame(&mut self) {
        let core = self.core_mut();
        core.frames.clear();
        core.current = Frame::default();
        core.last_time_slot = 0;
        self.on_new_frame();
    }

    /// Forget catalog-building state before a new pass over a capture.
    fn reset_parser_metadata(&mut self) {
        let core = self.core_mut();
        core.parser_metadata = FrameInformation::default();
        core.previous_time_slot = 0;
    }

    fn parser_metadata(&self) -> FrameInformation<Self::Boundary> {
        self.core().parser_metadata.clone()
    }

    fn set_parser_metadata(&mut self, metadata: FrameInformation<Self::Boundary>) {
        self.core_mut().parser_metadata = metadata;
    }

    fn should_crop_out(&self, position: [f64; 3]) -> bool {
        self.core().config.crop.should_crop_out(position)
    }

    fn is_calibrated(&self) -> bool {
        self.core().is_calibrated()
    }

    /// Fail fast when decoding is attempted without calibration.
    fn ensure_calibrated(&self) -> Result<()> {
        if self.is_calibrated() {
            Ok(())
        } else {
            Err(CaptureError::calibration(format!(
                "{} has no calibration loaded",
                self.sensor_information()
            )))
        }
    }

    fn framing_method(&self) -> FramingMethod {
        self.core().config.framing_method
    }

    fn set_framing_method(&mut self, method: FramingMethod) {
        debug!(?method, "Framing method changed");
        self.core_mut().config.framing_method = method;
    }
}

/// Local time formatted as a capture file stem, `YYYY-mm-dd-HH-MM-SS`.
pub fn default_record_file_name() -> String {
    chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string()
}
