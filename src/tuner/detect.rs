//! Tuner autodetection.

use super::{TunerBus, TunerFamily};

/// How to recognise one tuner family on the I2C bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunerDescriptor {
    pub family: TunerFamily,
    pub name: &'static str,
    /// 8-bit I2C address of the chip.
    pub i2c_addr: u8,
    /// Identification register.
    pub check_addr: u8,
    /// Expected identification value (after masking).
    pub check_val: u8,
    pub check_mask: u8,
}

impl TunerDescriptor {
    fn matches(&self, reg: u8) -> bool {
        reg & self.check_mask == self.check_val
    }
}

/// Registry of supported tuners, in [`TunerFamily`] order.
pub static TUNERS: [TunerDescriptor; 4] = [
    TunerDescriptor {
        family: TunerFamily::E4000,
        name: "Elonics E4000",
        i2c_addr: 0xc8,
        check_addr: 0x02,
        check_val: 0x40,
        check_mask: 0xff,
    },
    TunerDescriptor {
        family: TunerFamily::Fc0012,
        name: "Fitipower FC0012",
        i2c_addr: 0xc6,
        check_addr: 0x00,
        check_val: 0xa1,
        check_mask: 0xff,
    },
    TunerDescriptor {
        family: TunerFamily::Fc0013,
        name: "Fitipower FC0013",
        i2c_addr: 0xc6,
        check_addr: 0x00,
        check_val: 0xa3,
        check_mask: 0xff,
    },
    TunerDescriptor {
        family: TunerFamily::Fc2580,
        name: "FCI 2580",
        i2c_addr: 0xac,
        check_addr: 0x01,
        check_val: 0x56,
        // bit 7 of the FC2580 chip ID is not stable
        check_mask: 0x7f,
    },
];

/// GPIO that resets the FC2580/FC0012 on dongles that have one.
const TUNER_RESET_GPIO: u8 = 5;
/// GPIO driving the FC0012 V-band/U-band filter switch.
pub(crate) const FC0012_BAND_GPIO: u8 = 6;

enum Step {
    Probe(TunerFamily),
    ResetPulse(u8),
}

/// Probe order. The FC2580 and FC0012 only answer after a reset pulse.
const DETECTION_SEQUENCE: &[Step] = &[
    Step::Probe(TunerFamily::E4000),
    Step::Probe(TunerFamily::Fc0013),
    Step::ResetPulse(TUNER_RESET_GPIO),
    Step::Probe(TunerFamily::Fc2580),
    Step::Probe(TunerFamily::Fc0012),
];

/// Find the tuner fitted to the dongle.
///
/// The I2C repeater must be open. Probes run in a fixed order and stop at the
/// first match; a failed read counts as no match.
pub fn detect(bus: &dyn TunerBus) -> Option<TunerFamily> {
    for step in DETECTION_SEQUENCE {
        match *step {
            Step::Probe(family) => {
                if probe(bus, family) {
                    tracing::info!("Found {} tuner", family.name());
                    after_match(bus, family);
                    return Some(family);
                }
            }
            Step::ResetPulse(gpio) => {
                let pulse = bus
                    .set_gpio_output(gpio)
                    .and_then(|()| bus.set_gpio_bit(gpio, true))
                    .and_then(|()| bus.set_gpio_bit(gpio, false));
                if let Err(e) = pulse {
                    tracing::warn!("Tuner reset on GPIO {} failed: {}", gpio, e);
                }
            }
        }
    }

    tracing::warn!("No supported tuner found");
    None
}

fn probe(bus: &dyn TunerBus, family: TunerFamily) -> bool {
    let desc = family.descriptor();
    match bus.i2c_read_reg(desc.i2c_addr, desc.check_addr) {
        Ok(reg) => {
            tracing::debug!(
                "Probe {} at {:#04x}: reg {:#04x} = {:#04x}",
                family,
                desc.i2c_addr,
                desc.check_addr,
                reg
            );
            desc.matches(reg)
        }
        Err(e) => {
            tracing::debug!("Probe {} at {:#04x} failed: {}", family, desc.i2c_addr, e);
            false
        }
    }
}

fn after_match(bus: &dyn TunerBus, family: TunerFamily) {
    if family == TunerFamily::Fc0012 {
        if let Err(e) = bus.set_gpio_output(FC0012_BAND_GPIO) {
            tracing::warn!("Failed to configure FC0012 band switch GPIO: {}", e);
        }
    }
}
