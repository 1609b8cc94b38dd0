//! Frame sources
//!
//! - [`FileFrameSource`]: random access to the frames of a capture file
//! - [`LiveFrameSource`]: frames decoded continuously from a UDP stream

mod file;
mod live;

pub use file::{CaptureFrameIndex, CatalogStatus, FileFrameSource, TimeBasis};
pub use live::LiveFrameSource;
