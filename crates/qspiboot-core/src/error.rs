//! Error types for qspiboot-core
//!
//! This module provides a no_std compatible error type that can be used
//! throughout the crate.

use core::fmt;

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// QSPI transfer failed
    QspiTransferFailed,
    /// Flash write-in-progress bit did not clear within the poll budget
    FlashTimeout,
    /// No frame progress within the active timeout budget (fatal, device resets)
    LinkStalled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QspiTransferFailed => write!(f, "QSPI transfer failed"),
            Self::FlashTimeout => write!(f, "flash write-in-progress timeout"),
            Self::LinkStalled => write!(f, "no frame progress within timeout budget"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
