//! # Asensing decoder
//!
//! Reference [`Interpreter`] for Asensing point-cloud packets. A frame ends when
//! the sensor frame id changes, or when the frame already holds as many points
//! as the sensor announced in `point_num`.
//!
//! Positions come from the calibration correction tables when present, otherwise
//! from the azimuth and elevation reported for each return.

mod calibration;
pub mod format;
mod tables;

pub use calibration::AsensingCalibration;
pub use format::{AsensingHeader, AsensingPacket, Unit};
pub use tables::{CorrectionTable, RtMatrix, TrigTable};

use super::{FrameInformation, FramingMethod, Interpreter, InterpreterCore};
use crate::Result;
use crate::config::InterpreterConfig;
use crate::pcap::CapturePosition;
use crate::types::Point;
use std::path::Path;
use tracing::{debug, trace, warn};

/// Frame capacity used until a packet announces its own.
pub const DEFAULT_POINTS_PER_FRAME: usize = 60_000;

const PRE_PROCESS: usize = 0;
const PROCESS: usize = 1;

/// Last frame id seen by boundary pre-processing and by decoding, tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsensingBoundary {
    last_frame_id: [Option<u16>; 2],
}

impl AsensingBoundary {
    /// Record `frame_id` for `pass`, returning true when it differs from the previous one.
    ///
    /// The first id seen by a pass never counts as a new frame.
    fn is_new_frame(&mut self, pass: usize, frame_id: u16) -> bool {
        let previous = self.last_frame_id[pass].replace(frame_id);
        previous.is_some_and(|id| id != frame_id)
    }
}

#[derive(Debug)]
pub struct AsensingInterpreter {
    core: InterpreterCore<AsensingBoundary>,
    calibration: AsensingCalibration,
    points_per_frame: usize,
    /// Sample index within the current frame, skipped samples included
    current_point: usize,
}

impl AsensingInterpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        Self {
            core: InterpreterCore::new(config),
            calibration: AsensingCalibration::default(),
            points_per_frame: DEFAULT_POINTS_PER_FRAME,
            current_point: 0,
        }
    }

    pub fn calibration(&self) -> &AsensingCalibration {
        &self.calibration
    }

    pub fn points_per_frame(&self) -> usize {
        self.points_per_frame
    }

    fn position(&self, unit: &Unit, distance: f64, laser_id: usize) -> [f64; 3] {
        let corrected = self.calibration.corrections.as_ref().and_then(|t| t.apply(self.current_point, distance));
        let position = corrected.unwrap_or_else(|| {
            TrigTable::shared().to_cartesian(distance, unit.azimuth as i64, unit.elevation as i64)
        });
        match self.calibration.transform_for(laser_id) {
            Some(rt) => rt.transform(position),
            None => position,
        }
    }
}

impl Default for AsensingInterpreter {
    fn default() -> Self {
        Self::new(InterpreterConfig::default())
    }
}

impl Interpreter for AsensingInterpreter {
    type Boundary = AsensingBoundary;

    fn core(&self) -> &InterpreterCore<AsensingBoundary> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut InterpreterCore<AsensingBoundary> {
        &mut self.core
    }

    fn load_calibration(&mut self, path: &Path) -> Result<()> {
        match AsensingCalibration::load(path) {
            Ok(calibration) => {
                self.calibration = calibration;
                self.core.set_calibrated(path, true);
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Calibration not loaded");
                self.calibration = AsensingCalibration::default();
                self.core.set_calibrated(path, false);
                Err(e)
            }
        }
    }

    fn is_lidar_packet(&self, data: &[u8]) -> bool {
        AsensingPacket::parse(data).is_some()
    }

    fn process_packet(&mut self, data: &[u8]) {
        let Some(packet) = AsensingPacket::parse(data) else {
            return;
        };
        let header = packet.header;
        if header.point_num > 0 {
            self.points_per_frame = header.point_num as usize;
        }

        if self.core.parser_metadata_mut().specific.is_new_frame(PROCESS, header.frame_id) {
            trace!(frame_id = header.frame_id, "Sensor frame boundary");
            self.split_frame(false, FramingMethod::Interpreter);
        }

        let data_time = header.data_time().unwrap_or_default();
        let ignore_zero = self.core.config().ignore_zero_distances;
        for block in packet.blocks() {
            let timestamp = data_time + block.time_offset_us as f64 / 1e6;
            for (laser_id, unit) in block.units().enumerate() {
                if self.current_point >= self.points_per_frame {
                    debug!(
                        points = self.current_point,
                        frame_id = header.frame_id,
                        "More points than announced, sealing frame"
                    );
                    self.split_frame(true, FramingMethod::Interpreter);
                }

                let point_id = self.current_point;
                self.current_point += 1;
                if unit.distance == 0 && ignore_zero {
                    continue;
                }

                let distance = unit.distance_m();
                let position = self.position(&unit, distance, laser_id);
                self.core.push_point(Point {
                    position,
                    point_id: point_id as u32,
                    laser_id: laser_id as u32,
                    intensity: unit.intensity,
                    timestamp,
                    distance,
                });
            }
        }
    }

    fn pre_process_packet(
        &mut self,
        data: &[u8],
        position: CapturePosition,
        network_time: f64,
        catalog: Option<&mut Vec<FrameInformation<AsensingBoundary>>>,
    ) -> bool {
        let Some(header) = AsensingHeader::parse(data) else {
            return false;
        };
        let metadata = self.core.parser_metadata_mut();
        metadata.file_position = position;
        metadata.first_packet_network_time = network_time;
        metadata.first_packet_data_time = header.data_time().unwrap_or(network_time);

        if !metadata.specific.is_new_frame(PRE_PROCESS, header.frame_id) {
            return false;
        }
        if let Some(catalog) = catalog {
            catalog.push(metadata.clone());
        }
        true
    }

    fn sensor_information(&self) -> String {
        "Asensing LiDAR Sensor".to_string()
    }

    fn frame_capacity(&self, _previous_len: usize) -> usize {
        self.points_per_frame
    }

    fn on_new_frame(&mut self) {
        self.current_point = 0;
    }
}
