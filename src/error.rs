//! Error types for the scan engine.
//!
//! `ScanError` covers three kinds of failure:
//!
//! - **Driver errors** (`Driver`): a negative status from the capability layer,
//!   carrying the extended diagnostic text.
//! - **Protocol errors** (`NotArmed`, `AlreadyRunning`, `Busy`, `Unsupported`):
//!   recoverable caller mistakes that leave hardware untouched.
//! - **Resource and logic errors** (`Channel`, `Waveform`, `Setting`, `Config`),
//!   plus the soft `FrameTimeout` and `SinkPanicked` when the host's frame
//!   sink unwinds.
//!
//! Each layer crossed adds one line of context through [`ResultExt::context`],
//! building a cause chain that [`ScanError::report`] flattens for logging.

use std::time::Duration;

use daqmx_hal::DaqmxError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Driver(#[from] DaqmxError),

    #[error("Acquisition is not armed")]
    NotArmed,

    #[error("Acquisition is already running")]
    AlreadyRunning,

    #[error("Cannot change {setting} while an acquisition is running")]
    Busy { setting: &'static str },

    #[error("Unsupported acquisition configuration: {0}")]
    Unsupported(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Waveform error: {0}")]
    Waveform(String),

    #[error("Invalid value for {name}: {reason}")]
    Setting { name: &'static str, reason: String },

    #[error("Frame {frame} timed out after {timeout:?}")]
    FrameTimeout { frame: u32, timeout: Duration },

    #[error("Frame sink panicked on frame {frame}")]
    SinkPanicked { frame: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<ScanError>,
    },
}

impl ScanError {
    /// Build a setting validation error.
    pub fn setting(name: &'static str, reason: impl Into<String>) -> Self {
        Self::Setting {
            name,
            reason: reason.into(),
        }
    }

    /// The innermost error, skipping context layers.
    pub fn root(&self) -> &ScanError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// The driver error at the root of the chain, if any.
    pub fn driver_error(&self) -> Option<&DaqmxError> {
        match self.root() {
            Self::Driver(e) => Some(e),
            _ => None,
        }
    }

    /// Format the full cause chain on one line, outermost first.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            out.push_str(": ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}

impl From<figment::Error> for ScanError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Adds one line of context to a failing result.
pub trait ResultExt<T> {
    /// Wrap the error with a fixed context message.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Wrap the error with a lazily built context message.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<ScanError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ScanError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| ScanError::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}
