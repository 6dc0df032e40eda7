//! Tuner capability interface.
//!
//! The RTL2832U is paired with one of several RF tuner chips, reached over
//! I2C through the demodulator's repeater. The driver only knows how to find
//! out which one is fitted ([`detect`]) and how to call it ([`Tuner`]). The
//! chip algorithms themselves are supplied by a [`TunerFactory`].

mod detect;

use std::fmt;

pub use detect::{detect, TunerDescriptor, TUNERS};
pub(crate) use detect::FC0012_BAND_GPIO;

use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Supported tuner chip families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunerFamily {
    /// Elonics E4000
    E4000,
    /// Fitipower FC0012
    Fc0012,
    /// Fitipower FC0013
    Fc0013,
    /// FCI FC2580
    Fc2580,
}

impl TunerFamily {
    /// Probe descriptor of this family.
    pub fn descriptor(self) -> &'static TunerDescriptor {
        // TUNERS is indexed in declaration order of the enum
        &TUNERS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

impl fmt::Display for TunerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = match self {
            TunerFamily::E4000 => "E4000",
            TunerFamily::Fc0012 => "FC0012",
            TunerFamily::Fc0013 => "FC0013",
            TunerFamily::Fc2580 => "FC2580",
        };
        f.write_str(short)
    }
}

/// Bus access a tuner driver gets: I2C to the chip and the dongle GPIOs.
///
/// The repeater is already open whenever a [`Tuner`] method runs.
pub trait TunerBus {
    fn i2c_write(&self, i2c_addr: u8, data: &[u8]) -> Result<usize>;
    fn i2c_read(&self, i2c_addr: u8, buf: &mut [u8]) -> Result<usize>;
    fn i2c_write_reg(&self, i2c_addr: u8, reg: u8, val: u8) -> Result<()>;
    fn i2c_read_reg(&self, i2c_addr: u8, reg: u8) -> Result<u8>;
    fn set_gpio_bit(&self, gpio: u8, on: bool) -> Result<()>;
    fn set_gpio_output(&self, gpio: u8) -> Result<()>;
}

impl<T: Transport> TunerBus for Bus<T> {
    fn i2c_write(&self, i2c_addr: u8, data: &[u8]) -> Result<usize> {
        Bus::i2c_write(self, i2c_addr, data)
    }

    fn i2c_read(&self, i2c_addr: u8, buf: &mut [u8]) -> Result<usize> {
        Bus::i2c_read(self, i2c_addr, buf)
    }

    fn i2c_write_reg(&self, i2c_addr: u8, reg: u8, val: u8) -> Result<()> {
        Bus::i2c_write_reg(self, i2c_addr, reg, val)
    }

    fn i2c_read_reg(&self, i2c_addr: u8, reg: u8) -> Result<u8> {
        Bus::i2c_read_reg(self, i2c_addr, reg)
    }

    fn set_gpio_bit(&self, gpio: u8, on: bool) -> Result<()> {
        Bus::set_gpio_bit(self, gpio, on)
    }

    fn set_gpio_output(&self, gpio: u8) -> Result<()> {
        Bus::set_gpio_output(self, gpio)
    }
}

/// Operations every tuner chip driver provides.
pub trait Tuner: Send {
    fn init(&mut self, bus: &dyn TunerBus) -> Result<()>;
    fn exit(&mut self, bus: &dyn TunerBus) -> Result<()>;
    /// Tune to `freq_hz` (already ppm corrected).
    fn tune(&mut self, bus: &dyn TunerBus, freq_hz: u32) -> Result<()>;
    fn set_bandwidth(&mut self, bus: &dyn TunerBus, bandwidth_hz: u32) -> Result<()>;
    fn set_gain(&mut self, bus: &dyn TunerBus, gain_db: i32) -> Result<()>;
}

/// Builds the chip driver for a detected family.
pub trait TunerFactory {
    fn create(&self, family: TunerFamily) -> Box<dyn Tuner>;
}

/// Factory used when no chip drivers are plugged in.
///
/// Binds a [`BareTuner`]: the family is known, so register access and
/// detection work, but tuning is refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct BareTuners;

impl TunerFactory for BareTuners {
    fn create(&self, family: TunerFamily) -> Box<dyn Tuner> {
        Box::new(BareTuner { family })
    }
}

/// A detected tuner without a chip driver.
///
/// `init`, `exit` and `set_gain` succeed without touching the chip, like the
/// stock glue of every family; `tune` and `set_bandwidth` need the chip's
/// synthesizer and fail with [`Error::Tuner`].
#[derive(Debug, Clone, Copy)]
pub struct BareTuner {
    family: TunerFamily,
}

impl BareTuner {
    pub fn family(&self) -> TunerFamily {
        self.family
    }
}

impl Tuner for BareTuner {
    fn init(&mut self, _bus: &dyn TunerBus) -> Result<()> {
        tracing::warn!("No chip driver for {}, tuning unavailable", self.family.name());
        Ok(())
    }

    fn exit(&mut self, _bus: &dyn TunerBus) -> Result<()> {
        Ok(())
    }

    fn tune(&mut self, _bus: &dyn TunerBus, freq_hz: u32) -> Result<()> {
        Err(Error::tuner(
            self.family,
            format!("no chip driver to tune {} Hz", freq_hz),
        ))
    }

    fn set_bandwidth(&mut self, _bus: &dyn TunerBus, bandwidth_hz: u32) -> Result<()> {
        Err(Error::tuner(
            self.family,
            format!("no chip driver to set bandwidth {} Hz", bandwidth_hz),
        ))
    }

    fn set_gain(&mut self, _bus: &dyn TunerBus, _gain_db: i32) -> Result<()> {
        Ok(())
    }
}

/// Per-session tuner settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunerState {
    /// Last successfully tuned center frequency (Hz), before correction.
    pub freq: u32,
    /// Frequency correction (ppm).
    pub ppm: i32,
    /// Last successfully applied gain (dB).
    pub gain: i32,
}

impl TunerState {
    /// `freq_hz` scaled by the current ppm correction.
    pub fn corrected(&self, freq_hz: u32) -> u32 {
        (freq_hz as f64 * (1.0 + self.ppm as f64 / 1e6)) as u32
    }
}
