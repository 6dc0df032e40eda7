//! Known RTL2832U based dongles and device enumeration.

use rusb::{Context, UsbContext};

use crate::error::Result;

/// A supported USB device: vendor ID, product ID and display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownDevice {
    pub vid: u16,
    pub pid: u16,
    pub name: &'static str,
}

const fn known(vid: u16, pid: u16, name: &'static str) -> KnownDevice {
    KnownDevice { vid, pid, name }
}

/// Dongles this driver recognises.
pub static KNOWN_DEVICES: &[KnownDevice] = &[
    known(0x0bda, 0x2832, "Generic RTL2832U (e.g. hama nano)"),
    known(0x0bda, 0x2838, "ezcap USB 2.0 DVB-T/DAB/FM dongle"),
    known(0x0ccd, 0x00a9, "Terratec Cinergy T Stick Black (rev 1)"),
    known(0x0ccd, 0x00b3, "Terratec NOXON DAB/DAB+ USB dongle (rev 1)"),
    known(0x0ccd, 0x00e0, "Terratec NOXON DAB/DAB+ USB dongle (rev 2)"),
    known(0x1f4d, 0xb803, "GTek T803"),
    known(0x1f4d, 0xc803, "Lifeview LV5TDeluxe"),
    known(0x1b80, 0xd3a4, "Twintech UT-40"),
    known(0x1d19, 0x1101, "Dexatek DK DVB-T Dongle (Logilink VG0002A)"),
    known(0x1d19, 0x1102, "Dexatek DK DVB-T Dongle (MSI DigiVox mini II V3.0)"),
    known(0x0458, 0x707f, "Genius TVGo DVB-T03 USB dongle (Ver. B)"),
    known(0x1b80, 0xd393, "GIGABYTE GT-U7300"),
    known(0x1b80, 0xd395, "Peak 102569AGPK"),
    known(0x1b80, 0xd39d, "SVEON STV20 DVB-T USB & FM"),
];

/// Look up a VID/PID pair in [`KNOWN_DEVICES`].
pub fn find_known_device(vid: u16, pid: u16) -> Option<&'static KnownDevice> {
    KNOWN_DEVICES.iter().find(|d| d.vid == vid && d.pid == pid)
}

/// A connected, supported dongle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Index to pass to [`crate::RtlSdr::open`].
    pub index: u32,
    pub vid: u16,
    pub pid: u16,
    pub name: &'static str,
    pub bus_number: u8,
    pub address: u8,
}

/// List all connected supported devices.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let context = Context::new()?;
    let devices = context.devices()?;
    let mut result = Vec::new();

    for device in devices.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };

        if let Some(known) = find_known_device(desc.vendor_id(), desc.product_id()) {
            result.push(DeviceInfo {
                index: result.len() as u32,
                vid: known.vid,
                pid: known.pid,
                name: known.name,
                bus_number: device.bus_number(),
                address: device.address(),
            });
        }
    }

    Ok(result)
}

/// Number of connected supported devices. Enumeration failures count as none.
pub fn device_count() -> u32 {
    match list_devices() {
        Ok(devices) => devices.len() as u32,
        Err(e) => {
            tracing::warn!("Device enumeration failed: {}", e);
            0
        }
    }
}

/// Display name of the `index`-th connected device, or `""` if there is none.
pub fn device_name(index: u32) -> &'static str {
    list_devices()
        .ok()
        .and_then(|devices| devices.into_iter().nth(index as usize))
        .map(|d| d.name)
        .unwrap_or("")
}
