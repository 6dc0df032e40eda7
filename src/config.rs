//! Device configuration.

use std::time::Duration;

/// Default number of streaming transfers.
pub const DEFAULT_BUF_NUM: usize = 32;
/// Default streaming transfer size (256 KiB).
pub const DEFAULT_BUF_LENGTH: usize = 16 * 16384;
/// RTL2832U reference crystal.
pub const DEFAULT_XTAL_FREQ: u32 = 28_800_000;

/// Tunables of a device handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Number of transfers kept in flight while streaming.
    pub buf_num: usize,
    /// Size of each streaming transfer in bytes. Should be a multiple of 512.
    pub buf_len: usize,
    /// Upper bound of one event-loop iteration, and so of the cancel latency.
    pub event_timeout: Duration,
    /// Control transfer timeout; zero waits forever.
    pub control_timeout: Duration,
    /// Timeout of [`crate::RtlSdr::read_sync`].
    pub bulk_timeout: Duration,
    /// Demodulator crystal frequency in Hz.
    pub xtal_freq: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            buf_num: DEFAULT_BUF_NUM,
            buf_len: DEFAULT_BUF_LENGTH,
            event_timeout: Duration::from_secs(1),
            control_timeout: Duration::ZERO,
            bulk_timeout: Duration::from_millis(3000),
            xtal_freq: DEFAULT_XTAL_FREQ,
        }
    }
}

impl DeviceConfig {
    /// Default configuration with a custom streaming pool.
    pub fn with_buffers(buf_num: usize, buf_len: usize) -> Self {
        Self {
            buf_num,
            buf_len,
            ..Self::default()
        }
    }
}
