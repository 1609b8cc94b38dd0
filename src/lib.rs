//! Lidar capture engine: pcap replay and live UDP capture of point-cloud sensors.
//!
//! Lidarcap turns raw sensor datagrams into point-cloud frames, either from a
//! capture file with random access by frame index or time, or from a live UDP
//! stream decoded on a background worker.
//!
//! # Features
//!
//! - **Capture files**: classic pcap in both byte orders and resolutions, IPv4 reassembly
//! - **Frame catalog**: one pass over the file, then seek straight to any frame
//! - **Live capture**: unicast or multicast UDP, forwarding, recording and crash snapshots
//! - **Pluggable decoders**: the [`Interpreter`](interpreter::Interpreter) trait, with an Asensing decoder built in
//!
//! ## Example (capture replay)
//!
//! ```rust,no_run
//! use lidarcap::Lidarcap;
//! use lidarcap::interpreter::AsensingInterpreter;
//!
//! fn main() -> lidarcap::Result<()> {
//!     let mut source = Lidarcap::open("drive.pcap", "A0-No-Correction.json", AsensingInterpreter::default())?;
//!     for index in 0..source.frame_count() {
//!         let frame = source.get_frame(index)?;
//!         println!("frame {index}: {} points", frame.len());
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Packet plumbing
pub mod network;
pub mod pcap;
pub mod queue;

// Decoding and frame delivery
pub mod driver;
pub mod interpreter;
pub mod providers;

// Core exports
pub use error::*;
pub use types::*;

pub use config::{FileSourceConfig, LiveSourceConfig, SourceConfig};
pub use interpreter::{FramingMethod, Interpreter};
pub use providers::{FileFrameSource, LiveFrameSource, TimeBasis};

/// Unified entry point for lidar frame sources.
///
/// # Examples
///
/// ## Live capture
/// ```rust,no_run
/// use lidarcap::{Lidarcap, LiveSourceConfig};
/// use lidarcap::interpreter::AsensingInterpreter;
///
/// fn main() -> lidarcap::Result<()> {
///     let config = LiveSourceConfig {
///         listening_port: 51180,
///         calibration_file: Some("A0-No-Correction.json".into()),
///         ..LiveSourceConfig::default()
///     };
///     let mut source = Lidarcap::listen(config, AsensingInterpreter::default())?;
///     if source.needs_update() {
///         let _frame = source.take_frame();
///     }
///     Ok(())
/// }
/// ```
pub struct Lidarcap;

impl Lidarcap {
    /// Open a capture file with default settings and the given calibration.
    ///
    /// The frame index is built before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file does not exist or is not readable
    /// - The file is not a classic pcap capture
    /// - The link type is neither Ethernet nor BSD loopback
    /// - The calibration cannot be loaded
    pub fn open<P, C, I>(path: P, calibration: C, interpreter: I) -> Result<FileFrameSource<I>>
    where
        P: AsRef<std::path::Path>,
        C: Into<std::path::PathBuf>,
        I: Interpreter,
    {
        let config = FileSourceConfig { calibration_file: Some(calibration.into()), ..FileSourceConfig::default() };
        FileFrameSource::open(path, interpreter, config)
    }

    /// Bind a live source and start decoding.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - No calibration could be loaded
    /// - The socket cannot be bound or the multicast group joined
    pub fn listen<I>(config: LiveSourceConfig, interpreter: I) -> Result<LiveFrameSource<I>>
    where
        I: Interpreter + 'static,
    {
        let mut source = LiveFrameSource::new(interpreter, config)?;
        source.start()?;
        Ok(source)
    }
}
