//! Error types for capture replay and live decoding.
//!
//! All errors implement the `std::error::Error` trait and carry structured context
//! so callers can tell a missing file from a malformed one, or a bad configuration
//! from a frame index that is simply out of range.
//!
//! ## Error Categories
//!
//! - **File Errors**: capture or calibration files that cannot be opened, read or written
//! - **Parse Errors**: malformed container headers, calibration artifacts or config files
//! - **Calibration Errors**: decoding attempted without a usable calibration
//! - **Range Errors**: frame or time lookups outside the catalog
//! - **Socket Errors**: bind, join or send failures on the live path
//! - **Unsupported**: recoverable "not supported for this packet" outcomes (IPv6 reassembly)
//!
//! Transient conditions such as non-lidar traffic or a single malformed IP header are
//! never surfaced as errors; they are logged and skipped where they occur.
//!
//! ```rust
//! use lidarcap::CaptureError;
//!
//! let error = CaptureError::out_of_range("frame", 12, 10);
//! assert!(!error.is_retryable());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for capture operations.
pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

/// Main error type for capture, decode and streaming operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("Capture file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Unsupported link type {link_type} in capture file")]
    UnsupportedLinkType { link_type: u32 },

    #[error("{feature} is not supported")]
    Unsupported { feature: String },

    #[error("Calibration error: {reason}")]
    Calibration { reason: String },

    #[error("Requested {what} {index} is out of range (0..{len})")]
    OutOfRange { what: String, index: usize, len: usize },

    #[error("Socket operation failed: {operation}")]
    Socket {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Invalid state: {reason}")]
    State { reason: String },
}

impl CaptureError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            CaptureError::Socket { .. } => true,
            CaptureError::State { .. } => true,
            CaptureError::File { source, .. } => {
                matches!(source.kind(), std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock)
            }
            CaptureError::Parse { .. } => false,
            CaptureError::UnsupportedLinkType { .. } => false,
            CaptureError::Unsupported { .. } => false,
            CaptureError::Calibration { .. } => false,
            CaptureError::OutOfRange { .. } => false,
            CaptureError::Config { .. } => false,
        }
    }

    /// Returns true when the underlying file simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CaptureError::File { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            CaptureError::File { .. } => vec![
                "Check the file exists and is readable",
                "Check file permissions",
                "Ensure sufficient disk space when writing",
            ],
            CaptureError::Parse { .. } => vec![
                "Verify the file is a pcap capture or a valid calibration file",
                "Check the file was not truncated while recording",
            ],
            CaptureError::UnsupportedLinkType { .. } => vec![
                "Record the capture on an Ethernet or loopback interface",
                "Convert the capture with a third-party tool",
            ],
            CaptureError::Unsupported { .. } => vec![
                "Record the capture without IPv6 fragmentation",
                "Disable reassembly to keep the raw fragments",
            ],
            CaptureError::Calibration { .. } => vec![
                "Provide a calibration file for the selected sensor",
                "Check the calibration file contains the expected modules",
            ],
            CaptureError::OutOfRange { .. } => vec![
                "Query frame_count() before requesting a frame",
                "Check first and last frame hiding settings",
            ],
            CaptureError::Socket { .. } => vec![
                "Check no other process is bound to the listening port",
                "Verify the multicast group and interface address",
                "Retry once the network interface is up",
            ],
            CaptureError::Config { .. } => vec![
                "Check the configuration values",
                "Compare with the documented defaults",
            ],
            CaptureError::State { .. } => vec!["Stop the source before reconfiguring it"],
        }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CaptureError::File { path: path.into(), source }
    }

    /// Helper constructor for parse errors.
    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        CaptureError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for calibration errors.
    pub fn calibration(reason: impl Into<String>) -> Self {
        CaptureError::Calibration { reason: reason.into() }
    }

    /// Helper constructor for range errors.
    pub fn out_of_range(what: impl Into<String>, index: usize, len: usize) -> Self {
        CaptureError::OutOfRange { what: what.into(), index, len }
    }

    /// Helper constructor for socket errors.
    pub fn socket(operation: impl Into<String>, source: std::io::Error) -> Self {
        CaptureError::Socket { operation: operation.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        CaptureError::Config { reason: reason.into() }
    }

    /// Helper constructor for unsupported features.
    pub fn unsupported(feature: impl Into<String>) -> Self {
        CaptureError::Unsupported { feature: feature.into() }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::File { path: PathBuf::from("<unknown>"), source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_carry_their_context(
            context in "\\w+",
            details in ".*",
            index in 0usize..100_000,
            len in 0usize..100_000,
            link_type in 2u32..300u32
          ) {
            let parse = CaptureError::parse(context.clone(), details.clone());
            let range = CaptureError::out_of_range("frame", index, len);
            let link = CaptureError::UnsupportedLinkType { link_type };

            let parse_msg = parse.to_string();
            prop_assert!(parse_msg.contains(&context));
            prop_assert!(parse_msg.contains(&details));

            let range_msg = range.to_string();
            prop_assert!(range_msg.contains(&index.to_string()));
            prop_assert!(range_msg.contains(&len.to_string()));

            prop_assert!(link.to_string().contains(&link_type.to_string()));
          }

          #[test]
          fn io_conversion_preserves_message(reason in ".*") {
            let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, reason.clone());
            let converted: CaptureError = io_err.into();
            prop_assert!(converted.is_not_found());
            match converted {
              CaptureError::File { source, .. } => prop_assert_eq!(source.to_string(), reason),
              _ => prop_assert!(false, "Expected File error from io::Error conversion"),
            }
          }
        }
    }

    #[test]
    fn socket_errors_chain_their_source() {
        let err = CaptureError::socket(
            "bind 0.0.0.0:2368",
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        );
        let source = std::error::Error::source(&err).expect("socket error keeps its source");
        assert_eq!(source.to_string(), "address in use");
        assert!(err.is_retryable());
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<CaptureError>();
    }

    #[test]
    fn recovery_suggestions_are_actionable() {
        let errors = [
            CaptureError::calibration("missing module_0"),
            CaptureError::unsupported("IPv6 reassembly"),
            CaptureError::config("bad filter"),
            CaptureError::out_of_range("frame", 3, 2),
        ];
        for error in &errors {
            assert!(!error.is_retryable());
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty());
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn not_found_is_distinct_from_unreadable() {
        let missing = CaptureError::file_error(
            "/nope.pcap",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        let denied = CaptureError::file_error(
            "/root.pcap",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(missing.is_not_found());
        assert!(!denied.is_not_found());
    }
}
