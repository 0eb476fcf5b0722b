//! Error types for driver calls.
//!
//! Every driver call reports a signed status code. Negative codes are hard
//! failures and become a [`DaqmxError`]; positive codes are warnings, the call
//! succeeded and the warning is only logged.

use thiserror::Error;
use tracing::warn;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DaqmxError>;

/// Status code reported when a wait on a finite task times out.
pub const STATUS_WAIT_TIMEOUT: i32 = -200_560;
/// Status code reported when a task handle is not known to the driver.
pub const STATUS_INVALID_TASK: i32 = -200_088;
/// Status code reported when a physical channel name cannot be resolved.
pub const STATUS_PHYSICAL_CHAN_MISSING: i32 = -200_170;
/// Status code reported when a read asks for more samples than are available.
pub const STATUS_SAMPLES_NOT_AVAILABLE: i32 = -200_284;
/// Status code reported for an attribute value the device does not support.
pub const STATUS_INVALID_ATTRIBUTE_VALUE: i32 = -200_077;

/// A failed driver call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("DAQmx error {code} in {call}: {message}")]
pub struct DaqmxError {
    /// Negative status code returned by the driver
    pub code: i32,
    /// Name of the driver entry point that failed
    pub call: &'static str,
    /// Extended error text queried after the failure
    pub message: String,
}

impl DaqmxError {
    /// Create an error for a failed call.
    pub fn new(code: i32, call: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            call,
            message: message.into(),
        }
    }

    /// Check if this error is a wait timeout.
    pub fn is_timeout(&self) -> bool {
        self.code == STATUS_WAIT_TIMEOUT
    }
}

/// Map a raw status code to a result.
///
/// `extended` is only evaluated for failures and warnings, matching the driver
/// contract that extended error text describes the last non-zero status.
pub fn check_status<F>(code: i32, call: &'static str, extended: F) -> Result<i32>
where
    F: FnOnce() -> String,
{
    match code {
        0 => Ok(0),
        c if c > 0 => {
            warn!(code = c, call, message = %extended(), "DAQmx warning");
            Ok(c)
        }
        c => Err(DaqmxError::new(c, call, extended())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_zero_status_is_ok() {
        assert_eq!(check_status(0, "DAQmxStartTask", || unreachable!()), Ok(0));
    }

    #[test]
    #[traced_test]
    fn test_positive_status_is_warning() {
        let result = check_status(200_015, "DAQmxWriteAnalogF64", || "clipped".into());
        assert_eq!(result, Ok(200_015));
        assert!(logs_contain("DAQmx warning"));
    }

    #[test]
    fn test_negative_status_is_error() {
        let err = check_status(STATUS_WAIT_TIMEOUT, "DAQmxWaitUntilTaskDone", || {
            "wait timed out".into()
        })
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("-200560"));
        assert!(err.to_string().contains("DAQmxWaitUntilTaskDone"));
    }
}
