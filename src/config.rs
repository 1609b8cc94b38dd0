//! Source and decoder configuration
//!
//! Every struct has working defaults, so a YAML document only needs the keys it
//! wants to change:
//!
//! ```yaml
//! file:
//!   calibration_file: /data/calib/A0-No-Correction.json
//!   lidar_port: 51180
//! live:
//!   listening_port: 51180
//!   multicast_address: 239.0.0.1
//!   forwarding:
//!     port: 51181
//!   interpreter:
//!     framing_method: network_packet_time
//!     frame_duration_s: 0.1
//!     crop:
//!       mode: spherical
//!       region: [170.0, -170.0, -90.0, 90.0, 0.0, 200.0]
//! ```
//!
//! ## Usage Example
//!
//! ```rust
//! use lidarcap::config::{FramingMethod, SourceConfig};
//!
//! let config = SourceConfig::from_yaml_str("live: { listening_port: 7502 }").unwrap();
//! assert_eq!(config.live.listening_port, 7502);
//! assert_eq!(config.live.interpreter.framing_method, FramingMethod::Interpreter);
//! ```

use crate::interpreter::CropConfig;
use crate::{CaptureError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use tracing::debug;

pub use crate::interpreter::FramingMethod;

/// Decoder behaviour shared by file and live sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    pub framing_method: FramingMethod,
    /// Frame length for network-time framing, in seconds
    pub frame_duration_s: f64,
    pub ignore_zero_distances: bool,
    pub ignore_empty_frames: bool,
    /// Added to network times when building display timesteps
    pub time_offset_s: f64,
    /// Per-laser enable mask; lasers past the end of the mask stay enabled
    pub laser_selection: Option<Vec<bool>>,
    pub crop: CropConfig,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            framing_method: FramingMethod::Interpreter,
            frame_duration_s: 0.1,
            ignore_zero_distances: true,
            ignore_empty_frames: true,
            time_offset_s: 0.0,
            laser_selection: None,
            crop: CropConfig::default(),
        }
    }
}

impl InterpreterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.framing_method == FramingMethod::NetworkPacketTime
            && !(self.frame_duration_s.is_finite() && self.frame_duration_s > 0.0)
        {
            return Err(CaptureError::config(format!(
                "frame_duration_s must be positive for network time framing, got {}",
                self.frame_duration_s
            )));
        }
        Ok(())
    }

    /// Whether points of `laser_id` are kept.
    pub fn is_laser_selected(&self, laser_id: usize) -> bool {
        self.laser_selection.as_ref().and_then(|mask| mask.get(laser_id).copied()).unwrap_or(true)
    }
}

/// Settings for replaying a capture file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSourceConfig {
    pub calibration_file: Option<PathBuf>,
    /// Restrict decoding to one UDP port; all UDP traffic otherwise
    pub lidar_port: Option<u16>,
    /// Expose the usually partial first and last frames
    pub show_first_and_last_frame: bool,
    /// Use sensor time instead of capture time for timesteps
    pub use_packet_time_for_display: bool,
    pub reassemble: bool,
    pub interpreter: InterpreterConfig,
}

impl Default for FileSourceConfig {
    fn default() -> Self {
        Self {
            calibration_file: None,
            lidar_port: None,
            show_first_and_last_frame: false,
            use_packet_time_for_display: false,
            reassemble: true,
            interpreter: InterpreterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    pub ip: IpAddr,
    pub port: u16,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self { ip: IpAddr::V4(Ipv4Addr::LOCALHOST), port: 2369 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashAnalysisConfig {
    pub path: PathBuf,
    /// Number of most recent datagrams kept
    pub capacity: usize,
}

impl Default for CrashAnalysisConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("lidar-crash-analysis.pcap"), capacity: 5000 }
    }
}

/// Settings for a live UDP source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSourceConfig {
    pub listening_port: u16,
    pub multicast_address: Option<Ipv4Addr>,
    pub local_listening_address: IpAddr,
    pub forwarding: Option<ForwardingConfig>,
    pub crash_analysis: Option<CrashAnalysisConfig>,
    pub queue_capacity: usize,
    /// Sealed frames kept for the caller before the oldest is dropped
    pub frame_buffer_capacity: usize,
    pub detect_frame_dropping: bool,
    pub calibration_file: Option<PathBuf>,
    pub interpreter: InterpreterConfig,
}

impl Default for LiveSourceConfig {
    fn default() -> Self {
        Self {
            listening_port: 2368,
            multicast_address: None,
            local_listening_address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            forwarding: None,
            crash_analysis: None,
            queue_capacity: crate::queue::DEFAULT_QUEUE_CAPACITY,
            frame_buffer_capacity: 2,
            detect_frame_dropping: false,
            calibration_file: None,
            interpreter: InterpreterConfig::default(),
        }
    }
}

impl LiveSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(CaptureError::config("queue_capacity must be at least 1"));
        }
        if self.frame_buffer_capacity == 0 {
            return Err(CaptureError::config("frame_buffer_capacity must be at least 1"));
        }
        if let Some(group) = self.multicast_address.filter(|group| !group.is_multicast()) {
            return Err(CaptureError::config(format!("{} is not a multicast address", group)));
        }
        self.interpreter.validate()
    }
}

/// One configuration document with a section per source kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub file: FileSourceConfig,
    pub live: LiveSourceConfig,
}

impl SourceConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml)
            .map_err(|e| CaptureError::parse("source configuration", format!("YAML parsing failed: {}", e)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| CaptureError::file_error(path, e))?;
        let config = Self::from_yaml_str(&yaml)?;
        debug!(path = %path.display(), "Loaded source configuration");
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| CaptureError::parse("source configuration", format!("YAML encoding failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::CropMode;

    #[test]
    fn empty_document_yields_defaults() {
        let config = SourceConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, SourceConfig::default());
        assert_eq!(config.live.listening_port, 2368);
        assert_eq!(config.live.queue_capacity, 100_000);
        assert!(config.file.reassemble);
        assert!(config.live.interpreter.ignore_zero_distances);
    }

    #[test]
    fn nested_sections_override_selected_fields() {
        let yaml = r#"
file:
  lidar_port: 51180
  show_first_and_last_frame: true
live:
  multicast_address: 239.0.0.1
  forwarding: { port: 4000 }
  crash_analysis: { path: /tmp/crash.pcap }
  interpreter:
    framing_method: network_packet_time
    laser_selection: [true, false]
    crop:
      mode: spherical
      region: [170.0, -170.0, -90.0, 90.0, 0.0, 200.0]
"#;
        let config = SourceConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.file.lidar_port, Some(51180));
        assert!(config.file.show_first_and_last_frame);

        let live = &config.live;
        assert_eq!(live.multicast_address, Some(Ipv4Addr::new(239, 0, 0, 1)));
        assert_eq!(live.forwarding, Some(ForwardingConfig { ip: IpAddr::V4(Ipv4Addr::LOCALHOST), port: 4000 }));
        assert_eq!(live.crash_analysis.as_ref().map(|c| c.capacity), Some(5000));
        assert_eq!(live.interpreter.framing_method, FramingMethod::NetworkPacketTime);
        assert_eq!(live.interpreter.crop.mode, CropMode::Spherical);
        assert!(live.interpreter.is_laser_selected(0));
        assert!(!live.interpreter.is_laser_selected(1));
        assert!(live.interpreter.is_laser_selected(7));
        live.validate().unwrap();
    }

    #[test]
    fn invalid_values_fail_validation() {
        let mut live = LiveSourceConfig { multicast_address: Some(Ipv4Addr::new(10, 0, 0, 1)), ..Default::default() };
        assert!(matches!(live.validate(), Err(CaptureError::Config { .. })));

        live.multicast_address = None;
        live.interpreter.framing_method = FramingMethod::NetworkPacketTime;
        live.interpreter.frame_duration_s = 0.0;
        assert!(live.validate().is_err());
    }

    #[test]
    fn yaml_round_trip_preserves_config() {
        let mut config = SourceConfig::default();
        config.live.forwarding = Some(ForwardingConfig::default());
        config.file.calibration_file = Some(PathBuf::from("calib.json"));
        let yaml = config.to_yaml_string().unwrap();
        assert_eq!(SourceConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = SourceConfig::from_yaml_str("live: [not, a, map]").unwrap_err();
        assert!(matches!(err, CaptureError::Parse { .. }));
    }

    #[test]
    fn load_reports_missing_files() {
        let err = SourceConfig::load("/nonexistent/lidarcap.yaml").unwrap_err();
        assert!(err.is_not_found());
    }
}
