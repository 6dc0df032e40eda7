//! Error types for rs-rtl operations.

use thiserror::Error;

use crate::tuner::TunerFamily;

/// Result type for rs-rtl operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes of the rtl-sdr C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RtlErrorCode {
    /// Operation successful.
    Success = 0,
    /// Generic failure (bad handle, no tuner, transfer failure).
    Failure = -1,
    /// Asynchronous streaming was not running.
    NotRunning = -2,
}

impl RtlErrorCode {
    /// Get a human-readable name for the status code.
    pub fn name(self) -> &'static str {
        match self {
            RtlErrorCode::Success => "RTLSDR_SUCCESS",
            RtlErrorCode::Failure => "RTLSDR_ERROR",
            RtlErrorCode::NotRunning => "RTLSDR_ERROR_NOT_RUNNING",
        }
    }
}

/// Errors that can occur during RTL-SDR operations.
#[derive(Debug, Error)]
pub enum Error {
    /// USB operation failed.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// The streaming interface or its bulk endpoint could not be claimed.
    #[error("Failed to claim bulk interface: {0}")]
    ClaimFailed(String),

    /// No supported device at the requested index.
    #[error("No RTL-SDR device found at index {0}")]
    DeviceNotFound(u32),

    /// Control transfer failed.
    #[error("Control transfer failed: {0}")]
    ControlTransferFailed(String),

    /// Operation requires a tuner, but none was detected at open.
    #[error("No tuner bound to this device")]
    NoTuner,

    /// The tuner driver reported a failure.
    #[error("{family} tuner error: {reason}")]
    Tuner {
        family: TunerFamily,
        reason: String,
    },

    /// The frequency correction already has this value.
    #[error("Frequency correction already set to {0} ppm")]
    CorrectionUnchanged(i32),

    /// Parameter invalid.
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// Asynchronous streaming is not running.
    #[error("Asynchronous streaming is not running")]
    NotRunning,

    /// Every streaming transfer has failed; nothing is left in flight.
    #[error("Streaming stalled: no transfer left in flight")]
    StreamStalled,

    /// Streaming/bulk transfer error.
    #[error("Streaming error: {0}")]
    StreamingError(String),
}

impl Error {
    /// Create a tuner error for the given family.
    pub fn tuner<S: Into<String>>(family: TunerFamily, reason: S) -> Self {
        Error::Tuner {
            family,
            reason: reason.into(),
        }
    }

    /// The C API status code for this error.
    pub fn code(&self) -> RtlErrorCode {
        match self {
            Error::NotRunning => RtlErrorCode::NotRunning,
            _ => RtlErrorCode::Failure,
        }
    }
}
