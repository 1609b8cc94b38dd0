//! Decode worker between the packet queue and the frame buffer
//!
//! [`PacketConsumer`] runs one OS thread that blocks on the [`PacketQueue`],
//! decodes every lidar payload with the shared interpreter and publishes sealed
//! frames into a [`FrameBuffer`]. Stopping the queue ends the thread.

use crate::interpreter::Interpreter;
use crate::queue::PacketQueue;
use crate::types::{Frame, RawPacket};
use crate::{CaptureError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

const STATS_INTERVAL: u64 = 10_000;

/// Interpreter shared between the decode worker and its owner.
pub type SharedInterpreter<I> = Arc<Mutex<I>>;

/// Lock an interpreter, ignoring poisoning: a panic mid-decode only leaves a partial frame behind.
pub fn lock_interpreter<I>(interpreter: &Mutex<I>) -> MutexGuard<'_, I> {
    interpreter.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct PendingFrames {
    frames: VecDeque<Arc<Frame>>,
    dropped: u64,
}

/// Sealed frames waiting for the caller, newest last.
///
/// Holds at most `capacity` frames; older ones are discarded as new ones
/// arrive. Every pushed frame is also published on a watch channel.
#[derive(Debug)]
pub struct FrameBuffer {
    pending: Mutex<PendingFrames>,
    capacity: usize,
    latest: watch::Sender<Option<Arc<Frame>>>,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let (latest, _) = watch::channel(None);
        Self { pending: Mutex::new(PendingFrames::default()), capacity: capacity.max(1), latest }
    }

    fn lock(&self) -> MutexGuard<'_, PendingFrames> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, frame: Arc<Frame>) {
        {
            let mut pending = self.lock();
            if pending.frames.len() >= self.capacity {
                pending.frames.pop_front();
                pending.dropped += 1;
            }
            pending.frames.push_back(Arc::clone(&frame));
        }
        self.latest.send_replace(Some(frame));
    }

    /// Take the newest frame, discarding older pending ones.
    ///
    /// Returns the frame and how many pending frames were skipped over.
    pub fn take_latest(&self) -> Option<(Arc<Frame>, usize)> {
        let mut pending = self.lock();
        let latest = pending.frames.pop_back()?;
        let skipped = pending.frames.len();
        pending.frames.clear();
        Some((latest, skipped))
    }

    /// Number of frames not yet taken.
    pub fn pending(&self) -> usize {
        self.lock().frames.len()
    }

    /// Frames discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn clear(&self) {
        self.lock().frames.clear();
    }

    /// Receiver observing every published frame (latest wins).
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.latest.subscribe()
    }
}

/// Handle on the decode worker thread.
///
/// Dropping the handle stops the queue and joins the thread.
#[derive(Debug)]
pub struct PacketConsumer {
    queue: Arc<PacketQueue<RawPacket>>,
    thread: Option<JoinHandle<u64>>,
}

impl PacketConsumer {
    /// Start decoding packets from `queue` into `frames`.
    ///
    /// The interpreter's current frame is reset before the first packet.
    pub fn spawn<I>(
        interpreter: SharedInterpreter<I>,
        queue: Arc<PacketQueue<RawPacket>>,
        frames: Arc<FrameBuffer>,
    ) -> Result<Self>
    where
        I: Interpreter + 'static,
    {
        let worker_queue = Arc::clone(&queue);
        let thread = thread::Builder::new()
            .name("lidar-decoder".to_string())
            .spawn(move || Self::run(interpreter, worker_queue, frames))
            .map_err(|e| CaptureError::State { reason: format!("cannot spawn decode worker: {}", e) })?;
        Ok(Self { queue, thread: Some(thread) })
    }

    fn run<I: Interpreter>(interpreter: SharedInterpreter<I>, queue: Arc<PacketQueue<RawPacket>>, frames: Arc<FrameBuffer>) -> u64 {
        lock_interpreter(&interpreter).reset_current_frame();
        info!("Decode worker started");

        let mut packets = 0u64;
        let mut sealed = 0u64;
        while let Some(packet) = queue.dequeue() {
            packets += 1;
            sealed += handle_packet(&mut *lock_interpreter(&interpreter), &packet, &frames) as u64;
            if packets % STATS_INTERVAL == 0 {
                debug!(packets, frames = sealed, backlog = queue.len(), "Decode worker statistics");
            }
        }

        info!(packets, frames = sealed, "Decode worker stopped");
        packets
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the queue and wait for the worker, returning the packets it handled.
    pub fn stop(&mut self) -> u64 {
        let Some(thread) = self.thread.take() else {
            return 0;
        };
        self.queue.stop();
        match thread.join() {
            Ok(packets) => packets,
            Err(_) => {
                error!("Decode worker panicked");
                0
            }
        }
    }
}

impl Drop for PacketConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decode one packet and move any sealed frames into `frames`.
///
/// Returns the number of frames published.
pub fn handle_packet<I: Interpreter + ?Sized>(interpreter: &mut I, packet: &RawPacket, frames: &FrameBuffer) -> usize {
    if !interpreter.is_lidar_packet(&packet.data) {
        trace!(len = packet.len(), "Ignoring non-lidar datagram");
        return 0;
    }
    interpreter.process_packet_wrapped(&packet.data, packet.timestamp);
    if !interpreter.is_new_data() {
        return 0;
    }

    let published = interpreter.frames_available().len();
    for frame in interpreter.frames_available() {
        frames.push(Arc::clone(frame));
    }
    interpreter.clear_all_frames_available();
    if published > 1 {
        warn!(frames = published, "Several frames sealed by one packet");
    }
    published
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::AsensingInterpreter;
    use crate::test_utils::asensing_payload;
    use std::time::{Duration, Instant};

    #[test]
    fn frame_buffer_keeps_newest_frames() {
        let buffer = FrameBuffer::new(2);
        let mut watcher = buffer.subscribe();
        for len in 1..=3 {
            let mut frame = Frame::with_capacity(len);
            (0..len).for_each(|_| frame.push(Default::default()));
            buffer.push(Arc::new(frame));
        }
        assert_eq!(buffer.pending(), 2);
        assert_eq!(buffer.dropped(), 1);
        assert!(watcher.has_changed().unwrap());
        assert_eq!(watcher.borrow_and_update().as_ref().map(|f| f.len()), Some(3));

        let (latest, skipped) = buffer.take_latest().unwrap();
        assert_eq!((latest.len(), skipped), (3, 1));
        assert!(buffer.take_latest().is_none());
    }

    #[test]
    fn non_lidar_packets_are_ignored() {
        let mut interpreter = AsensingInterpreter::default();
        let buffer = FrameBuffer::new(2);
        let published = handle_packet(&mut interpreter, &RawPacket::new(vec![1, 2, 3], 1.0), &buffer);
        assert_eq!(published, 0);
        assert!(interpreter.core().current_frame().is_empty());
    }

    #[test]
    fn worker_publishes_sealed_frames() {
        let interpreter = Arc::new(Mutex::new(AsensingInterpreter::default()));
        let queue = Arc::new(PacketQueue::with_capacity(64));
        let frames = Arc::new(FrameBuffer::new(4));
        let mut consumer =
            PacketConsumer::spawn(Arc::clone(&interpreter), Arc::clone(&queue), Arc::clone(&frames)).unwrap();

        for (i, id) in [1u16, 1, 2, 3].into_iter().enumerate() {
            queue.enqueue(RawPacket::new(asensing_payload(id, 8, 4), i as f64));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.pending() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let (latest, skipped) = frames.take_latest().unwrap();
        assert_eq!(latest.len(), 32);
        assert_eq!(skipped, 1);

        assert_eq!(consumer.stop(), 4);
        assert!(!consumer.is_running());
        assert!(queue.is_stopped());
    }
}
