//! RTL2832U device handle.
//!
//! [`RtlSdr`] owns the transport and everything bound to it at open: the
//! detected tuner with its runtime state, the programmed sample rate and the
//! streaming pool. Every tuner call is bracketed by the I2C repeater gate.

use crate::bus::{Block, Bus, DEMOD_CTL, DEMOD_CTL_1, USB_EPA_CTL, USB_EPA_MAXPKT, USB_SYSCTL};
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::stream::{Canceller, StreamEngine};
use crate::transport::{Transport, UsbTransport, BULK_ENDPOINT};
use crate::tuner::{
    detect, BareTuners, Tuner, TunerFactory, TunerFamily, TunerState, FC0012_BAND_GPIO,
};

/// Highest output rate the resampler supports (Hz).
pub const MAX_SAMPLE_RATE: u32 = 3_200_000;

/// FC0012 V-band/U-band filter crossover (Hz).
const FC0012_BAND_SPLIT: u32 = 300_000_000;

/// Default low-pass FIR: 8 taps of 8 bits, then 8 taps of 12 bits packed.
const FIR_DEFAULT: [u8; 20] = [
    0xca, 0xdc, 0xd7, 0xd8, 0xe0, 0xf2, 0x0e, 0x35, 0x06, 0x50, 0x9c, 0x0d, 0x71, 0x11, 0x14,
    0x71, 0x74, 0x19, 0x41, 0x00,
];

/// Result of programming the resampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRate {
    /// Requested rate after clamping (Hz).
    pub requested: u32,
    /// Fixed-point resampler ratio written to the demodulator.
    pub ratio: u32,
    /// Rate the hardware actually produces (Hz).
    pub achieved: f64,
}

/// Compute the resampler ratio for `samp_rate` from a crystal of `xtal_freq`.
///
/// Rates above [`MAX_SAMPLE_RATE`] are clamped. The two low bits of the ratio
/// are always zero.
pub fn synthesize_rate(xtal_freq: u32, samp_rate: u32) -> Result<SampleRate> {
    if samp_rate == 0 {
        return Err(Error::InvalidParam("sample rate must be non-zero".to_string()));
    }
    let requested = samp_rate.min(MAX_SAMPLE_RATE);

    let scaled = (xtal_freq as u64) << 22;
    let ratio = (scaled / requested as u64) & !3;
    let ratio = u32::try_from(ratio)
        .ok()
        .filter(|&r| r != 0)
        .ok_or_else(|| {
            Error::InvalidParam(format!(
                "sample rate {} Hz out of resampler range for a {} Hz crystal",
                requested, xtal_freq
            ))
        })?;

    Ok(SampleRate {
        requested,
        ratio,
        achieved: scaled as f64 / ratio as f64,
    })
}

/// A tuner chip bound at open.
struct ActiveTuner {
    family: TunerFamily,
    driver: Box<dyn Tuner>,
    state: TunerState,
}

/// Handle to one RTL2832U dongle.
///
/// # Example
///
/// ```no_run
/// use rs_rtl::RtlSdr;
///
/// let mut sdr = RtlSdr::open(0)?;
/// sdr.set_sample_rate(2_048_000)?;
/// sdr.reset_buffer()?;
///
/// let mut buf = vec![0u8; 16 * 16384];
/// let n = sdr.read_sync(&mut buf)?;
/// println!("read {} bytes", n);
/// sdr.close()?;
/// # Ok::<(), rs_rtl::Error>(())
/// ```
pub struct RtlSdr<T: Transport = UsbTransport> {
    bus: Bus<T>,
    tuner: Option<ActiveTuner>,
    rate: u32,
    config: DeviceConfig,
    stream: StreamEngine,
    closed: bool,
}

impl RtlSdr<UsbTransport> {
    /// Open the `index`-th supported dongle with the default configuration.
    pub fn open(index: u32) -> Result<Self> {
        Self::open_with(index, DeviceConfig::default(), &BareTuners)
    }

    /// Open the `index`-th supported dongle.
    ///
    /// `tuners` builds the chip driver once the tuner has been identified.
    pub fn open_with(index: u32, config: DeviceConfig, tuners: &dyn TunerFactory) -> Result<Self> {
        let transport = UsbTransport::open(index, config.control_timeout)?;
        Self::from_transport(transport, config, tuners)
    }
}

impl<T: Transport> RtlSdr<T> {
    /// Bring up a device over an already claimed transport.
    ///
    /// Runs the baseband init sequence, then detects the tuner and initializes
    /// it. A device without a recognised tuner still opens.
    pub fn from_transport(transport: T, config: DeviceConfig, tuners: &dyn TunerFactory) -> Result<Self> {
        let mut dev = RtlSdr {
            bus: Bus::new(transport),
            tuner: None,
            rate: 0,
            config,
            stream: StreamEngine::new(),
            closed: false,
        };

        // on error, Drop tears down what was set up
        dev.init_baseband()?;
        dev.bind_tuner(tuners)?;
        Ok(dev)
    }

    fn init_baseband(&self) -> Result<()> {
        let bus = &self.bus;

        // initialize USB
        bus.write_reg(Block::Usb, USB_SYSCTL, 0x09, 1)?;
        bus.write_reg(Block::Usb, USB_EPA_MAXPKT, 0x0002, 2)?;
        bus.write_reg(Block::Usb, USB_EPA_CTL, 0x1002, 2)?;

        // power on demod
        bus.write_reg(Block::Sys, DEMOD_CTL_1, 0x22, 1)?;
        bus.write_reg(Block::Sys, DEMOD_CTL, 0xe8, 1)?;

        // reset demod (bit 3, soft_rst)
        bus.demod_write_reg(1, 0x01, 0x14, 1)?;
        bus.demod_write_reg(1, 0x01, 0x10, 1)?;

        // disable spectrum inversion and adjacent channel rejection
        bus.demod_write_reg(1, 0x15, 0x00, 1)?;
        bus.demod_write_reg(1, 0x16, 0x0000, 2)?;

        // clear DDC shift and IF frequency registers
        bus.demod_write_reg(1, 0x19, 0x0000, 2)?;

        for (i, &coeff) in FIR_DEFAULT.iter().enumerate() {
            bus.demod_write_reg(1, 0x1c + i as u16, coeff as u16, 1)?;
        }

        // enable SDR mode, disable DAGC (bit 5)
        bus.demod_write_reg(0, 0x19, 0x25, 1)?;

        // init FSM state-holding register
        bus.demod_write_reg(1, 0x93, 0xf0, 1)?;

        // disable AGC (en_dagc, bit 0)
        bus.demod_write_reg(1, 0x11, 0x00, 1)?;

        // disable PID filter (enable_PID = 0)
        bus.demod_write_reg(0, 0x61, 0x60, 1)?;

        // opt_adc_iq = 0, default ADC_I/ADC_Q datapath
        bus.demod_write_reg(0, 0x06, 0x80, 1)?;

        // enable zero-IF mode, DC cancellation and IQ estimation/compensation
        bus.demod_write_reg(1, 0xb1, 0x1b, 1)?;

        tracing::debug!("Baseband initialized");
        Ok(())
    }

    fn bind_tuner(&mut self, tuners: &dyn TunerFactory) -> Result<()> {
        let tuner = self.bus.with_repeater(|bus| {
            let Some(family) = detect(bus) else {
                return Ok(None);
            };
            let mut driver = tuners.create(family);
            if let Err(e) = driver.init(bus) {
                tracing::error!("Failed to initialize {} tuner: {}", family.name(), e);
            }
            Ok(Some(ActiveTuner {
                family,
                driver,
                state: TunerState::default(),
            }))
        })?;

        self.tuner = tuner;
        Ok(())
    }

    /// Power the demodulator down. Every step runs even if an earlier one
    /// failed.
    fn deinit_baseband(&mut self) {
        if let Err(e) = self.bus.set_i2c_repeater(true) {
            tracing::warn!("Failed to open I2C repeater: {}", e);
        }

        if let Some(tuner) = self.tuner.as_mut() {
            if let Err(e) = tuner.driver.exit(&self.bus) {
                tracing::warn!("{} tuner exit failed: {}", tuner.family, e);
            }
        }

        if let Err(e) = self.bus.set_i2c_repeater(false) {
            tracing::warn!("Failed to close I2C repeater: {}", e);
        }

        // poweroff demodulator and ADCs
        if let Err(e) = self.bus.write_reg(Block::Sys, DEMOD_CTL, 0x20, 1) {
            tracing::warn!("Failed to power off demodulator: {}", e);
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.deinit_baseband();
        self.bus.transport_mut().release()
    }

    /// Power down the tuner and demodulator and release the USB interface.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn tuner_mut(&mut self) -> Result<&mut ActiveTuner> {
        self.tuner.as_mut().ok_or(Error::NoTuner)
    }

    fn tuner_state(&self) -> Result<&TunerState> {
        self.tuner.as_ref().map(|t| &t.state).ok_or(Error::NoTuner)
    }

    /// Family of the tuner detected at open, if any.
    pub fn tuner_family(&self) -> Option<TunerFamily> {
        self.tuner.as_ref().map(|t| t.family)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Bus access, for register level tools.
    pub fn bus(&self) -> &Bus<T> {
        &self.bus
    }

    /// Tune to `freq` Hz, applying the frequency correction.
    pub fn set_center_freq(&mut self, freq: u32) -> Result<()> {
        let tuner = self.tuner.as_mut().ok_or(Error::NoTuner)?;
        let corrected = tuner.state.corrected(freq);
        let family = tuner.family;

        self.bus.with_repeater(|bus| {
            if family == TunerFamily::Fc0012 {
                bus.set_gpio_bit(FC0012_BAND_GPIO, corrected > FC0012_BAND_SPLIT)?;
            }
            tuner.driver.tune(bus, corrected)
        })?;

        tracing::debug!("Tuned to {} Hz ({} Hz corrected)", freq, corrected);
        tuner.state.freq = freq;
        Ok(())
    }

    /// Last successfully tuned frequency, uncorrected.
    pub fn get_center_freq(&self) -> Result<u32> {
        Ok(self.tuner_state()?.freq)
    }

    /// Set the frequency correction and retune at the current frequency.
    ///
    /// Setting the value already in effect fails with
    /// [`Error::CorrectionUnchanged`] and leaves the tuner alone.
    pub fn set_freq_correction(&mut self, ppm: i32) -> Result<()> {
        let tuner = self.tuner_mut()?;
        if tuner.state.ppm == ppm {
            return Err(Error::CorrectionUnchanged(ppm));
        }
        tuner.state.ppm = ppm;
        let freq = tuner.state.freq;

        self.set_center_freq(freq)
    }

    pub fn get_freq_correction(&self) -> Result<i32> {
        Ok(self.tuner_state()?.ppm)
    }

    /// Set the tuner gain in dB.
    pub fn set_tuner_gain(&mut self, gain: i32) -> Result<()> {
        let tuner = self.tuner.as_mut().ok_or(Error::NoTuner)?;
        self.bus.with_repeater(|bus| tuner.driver.set_gain(bus, gain))?;
        tuner.state.gain = gain;
        Ok(())
    }

    /// Last successfully applied gain (dB).
    pub fn get_tuner_gain(&self) -> Result<i32> {
        Ok(self.tuner_state()?.gain)
    }

    /// Program the resampler for `samp_rate` Hz.
    ///
    /// Returns the exact rate the hardware will produce. The tuner is told the
    /// new bandwidth on a best-effort basis.
    pub fn set_sample_rate(&mut self, samp_rate: u32) -> Result<SampleRate> {
        let rate = synthesize_rate(self.config.xtal_freq, samp_rate)?;
        tracing::info!("Setting sample rate: {:.3} Hz", rate.achieved);

        if let Some(tuner) = self.tuner.as_mut() {
            let bandwidth = rate.achieved as u32;
            if let Err(e) = self
                .bus
                .with_repeater(|bus| tuner.driver.set_bandwidth(bus, bandwidth))
            {
                tracing::warn!("{} tuner ignored bandwidth {} Hz: {}", tuner.family, bandwidth, e);
            }
        }

        self.bus
            .demod_write_reg(1, 0x9f, (rate.ratio >> 16) as u16, 2)?;
        self.bus
            .demod_write_reg(1, 0xa1, (rate.ratio & 0xffff) as u16, 2)?;

        self.rate = rate.requested;
        Ok(rate)
    }

    /// Last requested sample rate after clamping; 0 before the first set.
    pub fn get_sample_rate(&self) -> u32 {
        self.rate
    }

    /// Flush the device's sample FIFO.
    pub fn reset_buffer(&self) -> Result<()> {
        self.bus.write_reg(Block::Usb, USB_EPA_CTL, 0x1002, 2)?;
        self.bus.write_reg(Block::Usb, USB_EPA_CTL, 0x0000, 2)
    }

    /// Blocking read of raw 8-bit I/Q bytes. Returns the number of bytes read.
    pub fn read_sync(&self, buf: &mut [u8]) -> Result<usize> {
        self.bus
            .transport()
            .read_bulk(BULK_ENDPOINT, buf, self.config.bulk_timeout)
    }

    /// Stream samples to `callback` until cancelled.
    ///
    /// Blocks the calling thread. Use [`RtlSdr::canceller`] to stop the loop
    /// from the callback or another thread.
    pub fn read_async<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&[u8]),
    {
        self.stream
            .run(self.bus.transport_mut(), &self.config, callback)
    }

    /// Stop a running [`RtlSdr::read_async`].
    pub fn cancel_async(&self) -> Result<()> {
        self.stream.canceller().cancel()
    }

    /// Token that stops [`RtlSdr::read_async`] from any thread.
    pub fn canceller(&self) -> Canceller {
        self.stream.canceller()
    }
}

impl<T: Transport> Drop for RtlSdr<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Error while closing device: {}", e);
        }
    }
}
