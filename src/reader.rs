//! Sample readers.
//!
//! Convenience wrappers that open and configure a device in one go and hand
//! out raw unsigned 8-bit I/Q bytes: [`SampleReader`] as a blocking
//! [`Iterator`] over bulk reads, [`AsyncSampleReader`] as a [`Stream`] fed by
//! the asynchronous streaming engine on a background thread.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::config::DeviceConfig;
use crate::device::RtlSdr;
use crate::error::{Error, Result};
use crate::stream::Canceller;
use crate::transport::Transport;
use crate::tuner::TunerFactory;

/// Chunks buffered between the streaming thread and the consumer.
const CHANNEL_DEPTH: usize = 32;

/// One tuner setting taken from a [`ReaderConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerSetting {
    CenterFreq(u32),
    FreqCorrection(i32),
    Gain(i32),
}

impl TunerSetting {
    pub fn name(&self) -> &'static str {
        match self {
            TunerSetting::CenterFreq(_) => "Center frequency",
            TunerSetting::FreqCorrection(_) => "Frequency correction",
            TunerSetting::Gain(_) => "Tuner gain",
        }
    }

    /// Apply this setting. A correction equal to the current one is not an error.
    pub fn apply<T: Transport>(&self, sdr: &mut RtlSdr<T>) -> Result<()> {
        match *self {
            TunerSetting::CenterFreq(freq) => sdr.set_center_freq(freq),
            TunerSetting::FreqCorrection(ppm) => match sdr.set_freq_correction(ppm) {
                Ok(()) | Err(Error::CorrectionUnchanged(_)) => Ok(()),
                Err(e) => Err(e),
            },
            TunerSetting::Gain(gain) => sdr.set_tuner_gain(gain),
        }
    }
}

impl std::fmt::Display for TunerSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunerSetting::CenterFreq(freq) => write!(f, "{}: {} Hz", self.name(), freq),
            TunerSetting::FreqCorrection(ppm) => write!(f, "{}: {} ppm", self.name(), ppm),
            TunerSetting::Gain(gain) => write!(f, "{}: {} dB", self.name(), gain),
        }
    }
}

/// What to open and how to set it up.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderConfig {
    /// Device index (0 for the first dongle)
    pub device_index: u32,
    /// Center frequency in Hz; left alone when `None`
    pub center_freq: Option<u32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Tuner gain in dB; left alone when `None`
    pub gain: Option<i32>,
    /// Frequency correction in ppm; 0 leaves it alone
    pub ppm: i32,
    /// Device tunables
    pub device: DeviceConfig,
}

impl ReaderConfig {
    /// Create a new reader configuration.
    pub fn new(device_index: u32, center_freq: u32, sample_rate: u32, gain: Option<i32>) -> Self {
        Self {
            device_index,
            center_freq: Some(center_freq),
            sample_rate,
            gain,
            ppm: 0,
            device: DeviceConfig::default(),
        }
    }

    /// Tuner settings in the order they must be applied.
    ///
    /// A correction retunes at the stored frequency, so the frequency comes
    /// first.
    pub fn tuner_settings(&self) -> Vec<TunerSetting> {
        let mut settings = Vec::with_capacity(3);
        if let Some(freq) = self.center_freq {
            settings.push(TunerSetting::CenterFreq(freq));
        }
        if self.ppm != 0 {
            settings.push(TunerSetting::FreqCorrection(self.ppm));
        }
        if let Some(gain) = self.gain {
            settings.push(TunerSetting::Gain(gain));
        }
        settings
    }

    /// Apply the settings to an open device and flush its FIFO.
    pub fn apply<T: Transport>(&self, sdr: &mut RtlSdr<T>) -> Result<()> {
        sdr.set_sample_rate(self.sample_rate)?;
        for setting in self.tuner_settings() {
            setting.apply(sdr)?;
        }
        sdr.reset_buffer()
    }
}

/// Blocking reader over [`RtlSdr::read_sync`].
pub struct SampleReader<T: Transport = crate::transport::UsbTransport> {
    sdr: RtlSdr<T>,
    buf: Vec<u8>,
}

impl SampleReader {
    /// Open and configure the device described by `config`.
    pub fn open(config: &ReaderConfig, tuners: &dyn TunerFactory) -> Result<Self> {
        let mut sdr = RtlSdr::open_with(config.device_index, config.device.clone(), tuners)?;
        config.apply(&mut sdr)?;
        Ok(Self::from_device(sdr))
    }
}

impl<T: Transport> SampleReader<T> {
    /// Wrap an already configured device.
    pub fn from_device(sdr: RtlSdr<T>) -> Self {
        let buf = vec![0u8; sdr.config().buf_len];
        Self { sdr, buf }
    }

    pub fn device(&mut self) -> &mut RtlSdr<T> {
        &mut self.sdr
    }

    /// Close the underlying device.
    pub fn close(self) -> Result<()> {
        self.sdr.close()
    }
}

impl<T: Transport> Iterator for SampleReader<T> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.sdr.read_sync(&mut self.buf) {
            // end of stream
            Ok(0) => None,
            Ok(n) => Some(Ok(self.buf[..n].to_vec())),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Asynchronous reader: a background thread runs [`RtlSdr::read_async`] and
/// forwards each chunk through a channel.
///
/// Chunks that arrive while the channel is full are dropped and counted in
/// [`AsyncSampleReader::dropped_bytes`]. Dropping the reader cancels the
/// stream; the thread then closes the device.
pub struct AsyncSampleReader {
    rx: mpsc::Receiver<Result<Vec<u8>>>,
    canceller: Canceller,
    dropped: Arc<AtomicU64>,
    _handle: std::thread::JoinHandle<()>,
}

impl AsyncSampleReader {
    /// Open and configure the device described by `config` on a new thread.
    pub fn open<F>(config: &ReaderConfig, tuners: F) -> Result<Self>
    where
        F: TunerFactory + Send + 'static,
    {
        let cfg = config.clone();
        Self::spawn(move || {
            let mut sdr = RtlSdr::open_with(cfg.device_index, cfg.device.clone(), &tuners)?;
            cfg.apply(&mut sdr)?;
            Ok(sdr)
        })
    }

    /// Run `open` on a new thread and stream from the device it returns.
    ///
    /// Returns once the device is open, or with the error `open` failed with.
    pub fn spawn<T, O>(open: O) -> Result<Self>
    where
        T: Transport + 'static,
        O: FnOnce() -> Result<RtlSdr<T>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Result<Vec<u8>>>(CHANNEL_DEPTH);
        let (tx_init, rx_init) = std::sync::mpsc::channel::<Result<Canceller>>();
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_in_thread = dropped.clone();

        let handle = std::thread::spawn(move || {
            let mut sdr = match open() {
                Ok(sdr) => sdr,
                Err(e) => {
                    let _ = tx_init.send(Err(e));
                    return;
                }
            };

            // a cancel or drop before read_async starts must still end the session
            let canceller = sdr.canceller();
            canceller.arm();
            let _ = tx_init.send(Ok(canceller.clone()));

            let result = sdr.read_async(|data| match tx.try_send(Ok(data.to_vec())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped_in_thread.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    let _ = canceller.cancel();
                }
            });

            if let Err(e) = result {
                tracing::error!("Asynchronous streaming ended: {}", e);
                let _ = tx.blocking_send(Err(e));
            }

            if let Err(e) = sdr.close() {
                tracing::warn!("Failed to close device: {}", e);
            }
        });

        match rx_init.recv() {
            Ok(Ok(canceller)) => Ok(Self {
                rx,
                canceller,
                dropped,
                _handle: handle,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::StreamingError(
                "streaming thread exited before opening the device".to_string(),
            )),
        }
    }

    /// Bytes discarded because the consumer fell behind.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop streaming. The stream ends once buffered chunks are consumed.
    pub fn cancel(&self) -> Result<()> {
        self.canceller.cancel()
    }
}

impl Stream for AsyncSampleReader {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for AsyncSampleReader {
    fn drop(&mut self) {
        let _ = self.canceller.cancel();
    }
}
