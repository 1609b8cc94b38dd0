//! Live network input
//!
//! [`NetworkReceiver`] owns the UDP socket and feeds received datagrams into a
//! [`PacketQueue`](crate::queue::PacketQueue). [`UdpPacketBuilder`] wraps bare
//! payloads in the headers a capture file expects.

mod packet;
mod receiver;

pub use packet::{SYNTHETIC_HEADERS_LEN, UdpPacketBuilder};
pub use receiver::{NetworkReceiver, RECEIVE_BUFFER_SIZE, ReceiverConfig};
