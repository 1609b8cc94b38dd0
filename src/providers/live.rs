//! Continuously updated frames from a live sensor
//!
//! A running [`LiveFrameSource`] owns one receiver, one packet queue and one
//! decode worker. Callers poll [`needs_update`](LiveFrameSource::needs_update)
//! and [`take_frame`](LiveFrameSource::take_frame), or consume
//! [`subscribe`](LiveFrameSource::subscribe) as an async stream.
//!
//! `take_frame` keeps handing back the last frame when nothing new was sealed;
//! `needs_update` is what tells a fresh frame apart from a repeat.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use lidarcap::config::LiveSourceConfig;
//! use lidarcap::interpreter::AsensingInterpreter;
//! use lidarcap::providers::LiveFrameSource;
//!
//! async fn stream() -> lidarcap::Result<()> {
//!     let config = LiveSourceConfig {
//!         listening_port: 51180,
//!         calibration_file: Some("A0-No-Correction.json".into()),
//!         ..LiveSourceConfig::default()
//!     };
//!     let mut source = LiveFrameSource::new(AsensingInterpreter::default(), config)?;
//!     source.start()?;
//!
//!     let mut frames = Box::pin(source.subscribe());
//!     while let Some(frame) = frames.next().await {
//!         println!("{} points", frame.len());
//!     }
//!     Ok(())
//! }
//! ```

use crate::config::{CrashAnalysisConfig, ForwardingConfig, LiveSourceConfig};
use crate::driver::{FrameBuffer, PacketConsumer, SharedInterpreter, lock_interpreter};
use crate::interpreter::{CropConfig, FramingMethod, Interpreter, default_record_file_name};
use crate::network::{NetworkReceiver, ReceiverConfig};
use crate::queue::PacketQueue;
use crate::types::Frame;
use crate::{CaptureError, Result};
use futures::{Stream, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Receiver, queue and worker of a started source.
#[derive(Debug)]
struct Pipeline {
    receiver: NetworkReceiver,
    consumer: PacketConsumer,
}

/// Live UDP frame source.
///
/// Dropping the source stops it.
pub struct LiveFrameSource<I: Interpreter + 'static> {
    config: LiveSourceConfig,
    interpreter: SharedInterpreter<I>,
    frames: Arc<FrameBuffer>,
    pipeline: Option<Pipeline>,
    last_frame: Option<Arc<Frame>>,
}

impl<I: Interpreter + 'static> LiveFrameSource<I> {
    /// Prepare a source; nothing is bound until [`start`](Self::start).
    pub fn new(mut interpreter: I, config: LiveSourceConfig) -> Result<Self> {
        config.validate()?;
        interpreter.core_mut().set_config(config.interpreter.clone());
        if let Some(calibration) = &config.calibration_file {
            interpreter.load_calibration(calibration)?;
        }
        Ok(Self {
            frames: Arc::new(FrameBuffer::new(config.frame_buffer_capacity)),
            config,
            interpreter: Arc::new(Mutex::new(interpreter)),
            pipeline: None,
            last_frame: None,
        })
    }

    pub fn config(&self) -> &LiveSourceConfig {
        &self.config
    }

    /// Interpreter shared with the decode worker.
    pub fn interpreter(&self) -> SharedInterpreter<I> {
        Arc::clone(&self.interpreter)
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Address the receiver is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.pipeline.as_ref().map(|p| p.receiver.local_addr())
    }

    /// Bind the socket and start decoding.
    ///
    /// Fails with `Calibration` when no calibration was loaded, with `Socket` when
    /// the socket cannot be bound and with `State` when already running.
    pub fn start(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            return Err(CaptureError::State { reason: "live source is already running".to_string() });
        }
        lock_interpreter(&self.interpreter).ensure_calibrated()?;

        let queue = Arc::new(PacketQueue::with_capacity(self.config.queue_capacity));
        self.frames.clear();
        let mut consumer =
            PacketConsumer::spawn(Arc::clone(&self.interpreter), Arc::clone(&queue), Arc::clone(&self.frames))?;
        let receiver = match NetworkReceiver::start(ReceiverConfig::from(&self.config), queue) {
            Ok(receiver) => receiver,
            Err(e) => {
                consumer.stop();
                return Err(e);
            }
        };

        info!(local_addr = %receiver.local_addr(), "Live source started");
        self.pipeline = Some(Pipeline { receiver, consumer });
        Ok(())
    }

    /// Stop decoding, then receiving. The crash ring, if enabled, is flushed.
    ///
    /// The queue is closed and the decode worker joined before the socket goes
    /// away; datagrams arriving in between are discarded.
    pub fn stop(&mut self) {
        let Some(mut pipeline) = self.pipeline.take() else {
            return;
        };
        let packets = pipeline.consumer.stop();
        pipeline.receiver.stop();
        info!(packets, pending_frames = self.frames.pending(), "Live source stopped");
    }

    fn restart_if_running(&mut self) -> Result<()> {
        if self.pipeline.is_none() {
            return Ok(());
        }
        debug!("Restarting live source with new network settings");
        self.stop();
        self.start()
    }

    /// Whether a frame was sealed since the last [`take_frame`](Self::take_frame).
    pub fn needs_update(&self) -> bool {
        self.frames.pending() > 0
    }

    /// Most recent sealed frame.
    ///
    /// When nothing new arrived this returns the previously returned frame again,
    /// so once a frame has been seen it never goes back to `None`. Gate calls on
    /// [`needs_update`](Self::needs_update) to tell new frames from repeats.
    ///
    /// Older pending frames are skipped; with `detect_frame_dropping` set, skipping
    /// is reported as a warning.
    pub fn take_frame(&mut self) -> Option<Arc<Frame>> {
        if let Some((frame, skipped)) = self.frames.take_latest() {
            if skipped > 0 && self.config.detect_frame_dropping {
                warn!(dropped = skipped, "Frames dropped, the caller is not keeping up");
            }
            self.last_frame = Some(frame);
        }
        self.last_frame.clone()
    }

    /// Stream of sealed frames; slow consumers only see the latest one.
    pub fn subscribe(&self) -> impl Stream<Item = Arc<Frame>> + 'static {
        WatchStream::from_changes(self.frames.subscribe()).filter_map(|frame| async move { frame })
    }

    /// Record every received datagram to `path`, or to a timestamped file in the
    /// working directory when no path is given. Returns the file path.
    pub fn start_recording(&mut self, path: Option<&Path>) -> Result<PathBuf> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(format!("{}.pcap", default_record_file_name())));
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| CaptureError::State { reason: "recording needs a running live source".to_string() })?;
        pipeline.receiver.start_recording(&path)?;
        Ok(path)
    }

    /// Finish recording, returning the number of datagrams written.
    pub fn stop_recording(&mut self) -> Result<u64> {
        match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.receiver.stop_recording(),
            None => Ok(0),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.pipeline.as_ref().is_some_and(|p| p.receiver.is_recording())
    }

    /// Write the most recent datagrams to the crash-analysis file now.
    pub fn flush_crash_capture(&self) -> Result<u64> {
        match &self.pipeline {
            Some(pipeline) => pipeline.receiver.flush_crash_capture(),
            None => Ok(0),
        }
    }

    pub fn set_listening_port(&mut self, port: u16) -> Result<()> {
        self.config.listening_port = port;
        self.restart_if_running()
    }

    pub fn set_multicast_address(&mut self, group: Option<Ipv4Addr>) -> Result<()> {
        self.config.multicast_address = group;
        self.config.validate()?;
        self.restart_if_running()
    }

    pub fn set_local_listening_address(&mut self, address: IpAddr) -> Result<()> {
        self.config.local_listening_address = address;
        self.restart_if_running()
    }

    pub fn set_forwarding(&mut self, forwarding: Option<ForwardingConfig>) -> Result<()> {
        self.config.forwarding = forwarding;
        self.restart_if_running()
    }

    pub fn set_crash_analysis(&mut self, crash_analysis: Option<CrashAnalysisConfig>) -> Result<()> {
        self.config.crash_analysis = crash_analysis;
        self.restart_if_running()
    }

    /// Load a calibration into the running interpreter.
    pub fn set_calibration_file(&mut self, path: PathBuf) -> Result<()> {
        let loaded = lock_interpreter(&self.interpreter).load_calibration(&path);
        self.config.calibration_file = Some(path);
        loaded
    }

    pub fn set_crop(&mut self, crop: CropConfig) {
        self.config.interpreter.crop = crop.clone();
        lock_interpreter(&self.interpreter).core_mut().set_crop(crop);
    }

    pub fn set_laser_selection(&mut self, selection: Option<Vec<bool>>) {
        self.config.interpreter.laser_selection = selection.clone();
        lock_interpreter(&self.interpreter).core_mut().set_laser_selection(selection);
    }

    pub fn set_framing_method(&mut self, method: FramingMethod) -> Result<()> {
        self.config.interpreter.framing_method = method;
        self.config.interpreter.validate()?;
        lock_interpreter(&self.interpreter).set_framing_method(method);
        Ok(())
    }
}

impl<I: Interpreter + 'static> Drop for LiveFrameSource<I> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::AsensingInterpreter;

    fn config() -> LiveSourceConfig {
        LiveSourceConfig {
            listening_port: 0,
            local_listening_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            calibration_file: Some(PathBuf::from("Test-No-Correction.json")),
            ..LiveSourceConfig::default()
        }
    }

    #[test]
    fn start_requires_calibration() {
        let config = LiveSourceConfig { calibration_file: None, ..config() };
        let mut source = LiveFrameSource::new(AsensingInterpreter::default(), config).unwrap();
        assert!(matches!(source.start(), Err(CaptureError::Calibration { .. })));
        assert!(!source.is_running());
    }

    #[test]
    fn start_and_stop_are_state_checked() {
        let mut source = LiveFrameSource::new(AsensingInterpreter::default(), config()).unwrap();
        source.start().unwrap();
        assert!(source.local_addr().is_some());
        assert!(matches!(source.start(), Err(CaptureError::State { .. })));

        source.stop();
        source.stop();
        assert!(!source.is_running());
        assert!(matches!(source.start_recording(None), Err(CaptureError::State { .. })));
        assert_eq!(source.stop_recording().unwrap(), 0);
    }

    #[test]
    fn nothing_to_take_before_any_frame() {
        let mut source = LiveFrameSource::new(AsensingInterpreter::default(), config()).unwrap();
        assert!(!source.needs_update());
        assert!(source.take_frame().is_none());
    }
}
