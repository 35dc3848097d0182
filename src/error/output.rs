// Output error types and constants

use crate::error::ErrorCode;
use log::error;
use std::collections::TryReserveError;
use std::fmt;

/// Output error code constants
///
/// Single source of truth for the numeric codes attached to [`OutputError`].
///
/// Error code range: 2001-2009
pub struct OutputErrorCodes {}

impl OutputErrorCodes {
    /// Buffer, scratch or channel memory could not be obtained
    pub const ALLOCATION_FAILURE: i32 = 2001;

    /// The host lacks the feature the selected strategy needs
    pub const CAPABILITY_UNAVAILABLE: i32 = 2002;

    /// The host refused to create the sound channel
    pub const CHANNEL_CREATION_FAILURE: i32 = 2003;

    /// The conversion gate returned a length other than the period length
    pub const CONVERSION_LENGTH_MISMATCH: i32 = 2004;

    /// The requested format cannot describe a playable period
    pub const UNSUPPORTED_FORMAT: i32 = 2005;

    /// The channel rejected a command
    pub const COMMAND_FAILED: i32 = 2006;

    /// The device is not open
    pub const NOT_OPEN: i32 = 2007;

    /// Mutex was poisoned by a panicking producer
    pub const LOCK_POISONED: i32 = 2008;

    /// unlock() was called without a matching lock()
    pub const UNBALANCED_UNLOCK: i32 = 2009;
}

/// Log an output error with structured context
///
/// Emits the numeric code, the component and the message on one line.
/// The logging is non-blocking and will not panic on failure.
pub fn log_output_error(err: &OutputError, context: &str) {
    error!(
        "Output error in {}: code={}, component=OutputDevice, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Errors raised by the double-buffered output backend
///
/// Open-time errors are returned directly. Errors raised inside the
/// notification context are parked on the device and reported by the next
/// `lock`, `unlock` or `close` call.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputError {
    /// Buffer, scratch or channel memory could not be obtained
    AllocationFailure { what: String, bytes: usize },

    /// The host lacks the feature the selected strategy needs
    CapabilityUnavailable { feature: String },

    /// The host refused to create the sound channel
    ChannelCreationFailure { reason: String },

    /// The conversion gate returned a length other than the period length
    ConversionLengthMismatch { expected: usize, actual: usize },

    /// The requested format cannot describe a playable period
    UnsupportedFormat { reason: String },

    /// The channel rejected a command
    CommandFailed { reason: String },

    /// The device is not open
    NotOpen,

    /// Mutex was poisoned by a panicking producer
    LockPoisoned { component: String },

    /// unlock() was called without a matching lock()
    UnbalancedUnlock,
}

impl OutputError {
    /// Map a failed reservation onto [`OutputError::AllocationFailure`].
    pub fn allocation(what: &str, bytes: usize, _err: TryReserveError) -> Self {
        OutputError::AllocationFailure {
            what: what.to_string(),
            bytes,
        }
    }

    /// True for errors raised while playback was running, as opposed to
    /// errors returned by a failed open.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            OutputError::ConversionLengthMismatch { .. }
                | OutputError::LockPoisoned { .. }
                | OutputError::CommandFailed { .. }
        )
    }
}

impl ErrorCode for OutputError {
    fn code(&self) -> i32 {
        match self {
            OutputError::AllocationFailure { .. } => OutputErrorCodes::ALLOCATION_FAILURE,
            OutputError::CapabilityUnavailable { .. } => OutputErrorCodes::CAPABILITY_UNAVAILABLE,
            OutputError::ChannelCreationFailure { .. } => {
                OutputErrorCodes::CHANNEL_CREATION_FAILURE
            }
            OutputError::ConversionLengthMismatch { .. } => {
                OutputErrorCodes::CONVERSION_LENGTH_MISMATCH
            }
            OutputError::UnsupportedFormat { .. } => OutputErrorCodes::UNSUPPORTED_FORMAT,
            OutputError::CommandFailed { .. } => OutputErrorCodes::COMMAND_FAILED,
            OutputError::NotOpen => OutputErrorCodes::NOT_OPEN,
            OutputError::LockPoisoned { .. } => OutputErrorCodes::LOCK_POISONED,
            OutputError::UnbalancedUnlock => OutputErrorCodes::UNBALANCED_UNLOCK,
        }
    }

    fn message(&self) -> String {
        match self {
            OutputError::AllocationFailure { what, bytes } => {
                format!("Out of memory allocating {} ({} bytes)", what, bytes)
            }
            OutputError::CapabilityUnavailable { feature } => {
                format!("Sound manager doesn't support {}", feature)
            }
            OutputError::ChannelCreationFailure { reason } => {
                format!("Unable to create audio channel: {}", reason)
            }
            OutputError::ConversionLengthMismatch { expected, actual } => {
                format!(
                    "Converted period is {} bytes, hardware buffer needs {}",
                    actual, expected
                )
            }
            OutputError::UnsupportedFormat { reason } => {
                format!("Unsupported audio format: {}", reason)
            }
            OutputError::CommandFailed { reason } => {
                format!("Sound channel command failed: {}", reason)
            }
            OutputError::NotOpen => "Output device not open. Call open() first.".to_string(),
            OutputError::LockPoisoned { component } => {
                format!("Lock poisoned on {}", component)
            }
            OutputError::UnbalancedUnlock => {
                "unlock() called without a matching lock()".to_string()
            }
        }
    }
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OutputError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for OutputError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_error_codes() {
        assert_eq!(
            OutputError::AllocationFailure {
                what: "buffer".to_string(),
                bytes: 10
            }
            .code(),
            OutputErrorCodes::ALLOCATION_FAILURE
        );
        assert_eq!(
            OutputError::CapabilityUnavailable {
                feature: "double-buffering".to_string()
            }
            .code(),
            OutputErrorCodes::CAPABILITY_UNAVAILABLE
        );
        assert_eq!(
            OutputError::ChannelCreationFailure {
                reason: "test".to_string()
            }
            .code(),
            OutputErrorCodes::CHANNEL_CREATION_FAILURE
        );
        assert_eq!(
            OutputError::ConversionLengthMismatch {
                expected: 176,
                actual: 88
            }
            .code(),
            OutputErrorCodes::CONVERSION_LENGTH_MISMATCH
        );
        assert_eq!(
            OutputError::UnsupportedFormat {
                reason: "test".to_string()
            }
            .code(),
            OutputErrorCodes::UNSUPPORTED_FORMAT
        );
        assert_eq!(
            OutputError::CommandFailed {
                reason: "test".to_string()
            }
            .code(),
            OutputErrorCodes::COMMAND_FAILED
        );
        assert_eq!(OutputError::NotOpen.code(), OutputErrorCodes::NOT_OPEN);
        assert_eq!(
            OutputError::LockPoisoned {
                component: "mix engine".to_string()
            }
            .code(),
            OutputErrorCodes::LOCK_POISONED
        );
        assert_eq!(
            OutputError::UnbalancedUnlock.code(),
            OutputErrorCodes::UNBALANCED_UNLOCK
        );
    }

    #[test]
    fn test_output_error_messages() {
        let err = OutputError::ConversionLengthMismatch {
            expected: 176,
            actual: 88,
        };
        assert_eq!(
            err.message(),
            "Converted period is 88 bytes, hardware buffer needs 176"
        );

        let err = OutputError::CapabilityUnavailable {
            feature: "double-buffering".to_string(),
        };
        assert_eq!(
            err.message(),
            "Sound manager doesn't support double-buffering"
        );

        let err = OutputError::NotOpen;
        assert!(err.message().contains("not open"));
    }

    #[test]
    fn test_output_error_display() {
        let err = OutputError::UnbalancedUnlock;
        let display = format!("{}", err);
        assert!(display.contains("OutputError"));
        assert!(display.contains(&err.code().to_string()));
    }

    #[test]
    fn test_allocation_from_try_reserve() {
        let mut data: Vec<u8> = Vec::new();
        let reserve_err = data.try_reserve_exact(usize::MAX).unwrap_err();
        let err = OutputError::allocation("playback buffer", usize::MAX, reserve_err);
        match err {
            OutputError::AllocationFailure { what, bytes } => {
                assert_eq!(what, "playback buffer");
                assert_eq!(bytes, usize::MAX);
            }
            other => panic!("Expected AllocationFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_fault_classification() {
        assert!(OutputError::ConversionLengthMismatch {
            expected: 4,
            actual: 2
        }
        .is_fault());
        assert!(!OutputError::NotOpen.is_fault());
        assert!(!OutputError::CapabilityUnavailable {
            feature: "x".to_string()
        }
        .is_fault());
    }
}
