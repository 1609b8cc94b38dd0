//! Core data types shared by capture replay and live decoding.
//!
//! - [`RawPacket`] is one reassembled UDP payload with its capture time. It is the
//!   unit that flows through the packet queue into the decode worker.
//! - [`CaptureTimestamp`] is the second/microsecond pair stored in capture records.
//! - [`Frame`] is a decoded point cloud with parallel per-point attributes.
//!
//! ## Usage Example
//!
//! ```rust
//! use lidarcap::types::{Frame, Point, RawPacket};
//!
//! let packet = RawPacket::new(vec![0xAA, 0x55, 0xA5, 0x5A], 1_700_000_000.25);
//! assert_eq!(packet.len(), 4);
//!
//! let mut frame = Frame::with_capacity(16);
//! frame.push(Point { position: [1.0, 2.0, 0.5], laser_id: 3, intensity: 80, ..Point::default() });
//! assert_eq!(frame.len(), 1);
//! assert_eq!(frame.reserved_points(), 16);
//! ```

mod frame;
mod packet;

pub use frame::{Frame, Point};
pub use packet::{CaptureTimestamp, RawPacket};
