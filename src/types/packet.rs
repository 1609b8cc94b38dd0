//! Raw packet and timestamp types

use std::time::{SystemTime, UNIX_EPOCH};

/// One UDP payload together with the time it was captured.
///
/// Owned by exactly one queue slot until the decode worker consumes it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    /// Payload bytes (UDP header already stripped)
    pub data: Vec<u8>,

    /// Capture time in seconds since the Unix epoch
    pub timestamp: f64,
}

impl RawPacket {
    /// Create a new raw packet
    pub fn new(data: Vec<u8>, timestamp: f64) -> Self {
        Self { data, timestamp }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for an empty payload
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Capture record timestamp, as stored in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct CaptureTimestamp {
    pub secs: u32,
    pub micros: u32,
}

impl CaptureTimestamp {
    pub fn new(secs: u32, micros: u32) -> Self {
        Self { secs, micros }
    }

    /// Wall-clock now, truncated to microseconds.
    pub fn now() -> Self {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self { secs: elapsed.as_secs() as u32, micros: elapsed.subsec_micros() }
    }

    /// Build from floating seconds since the epoch.
    pub fn from_secs_f64(seconds: f64) -> Self {
        let seconds = seconds.max(0.0);
        let secs = seconds.trunc();
        let mut micros = ((seconds - secs) * 1e6).round() as u32;
        let mut secs = secs as u32;
        if micros >= 1_000_000 {
            secs += 1;
            micros -= 1_000_000;
        }
        Self { secs, micros }
    }

    /// Seconds since the epoch as a float (the "network time" of a packet).
    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + self.micros as f64 / 1e6
    }
}
