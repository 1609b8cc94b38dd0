//! Capture container I/O (classic pcap)
//!
//! Reading yields one record per UDP datagram, with fragmented IPv4 datagrams
//! reassembled. Writing accepts either whole link-layer frames or bare payloads
//! that get a synthetic Ethernet/IPv4/UDP header.

mod filter;
pub mod format;
pub mod ip;
mod reader;
mod writer;

pub use filter::PacketFilter;
pub use format::LinkType;
pub use reader::{CapturePosition, CaptureReader, CaptureRecord, RawRecord};
pub use writer::CaptureWriter;
