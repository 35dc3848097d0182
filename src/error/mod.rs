// Error types for the double-buffered output backend
//
// This module defines the error type surfaced by open/close/lock/unlock and by
// the notification path, with stable numeric codes for callers that log or
// forward errors across a process boundary.

mod output;

pub use output::{log_output_error, OutputError, OutputErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
