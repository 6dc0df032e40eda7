//! Register access over vendor control transfers.
//!
//! The RTL2832U exposes several register spaces ("blocks") through a single
//! vendor request. The block is encoded in the high byte of `wIndex`, bit 4 of
//! `wIndex` selects a write. The demodulator has a second, paged addressing
//! mode, and the I2C bus to the tuner is reached through the IIC block.

use crate::error::{Error, Result};
use crate::transport::Transport;

/// REQUEST_TYPE_VENDOR | ENDPOINT_IN
const CTRL_IN: u8 = 0xC0;
/// REQUEST_TYPE_VENDOR | ENDPOINT_OUT
const CTRL_OUT: u8 = 0x40;

const WRITE_FLAG: u16 = 0x10;
const DEMOD_SUBCMD: u16 = 0x20;

/// Logical register address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Block {
    Demod = 0,
    Usb = 1,
    Sys = 2,
    Tuner = 3,
    Rom = 4,
    Ir = 5,
    Iic = 6,
}

impl Block {
    /// `wIndex` for a read from this block.
    pub fn read_index(self) -> u16 {
        (self as u16) << 8
    }

    /// `wIndex` for a write to this block.
    pub fn write_index(self) -> u16 {
        self.read_index() | WRITE_FLAG
    }
}

// USB block registers
pub const USB_SYSCTL: u16 = 0x2000;
pub const USB_CTRL: u16 = 0x2010;
pub const USB_STAT: u16 = 0x2014;
pub const USB_EPA_CFG: u16 = 0x2144;
pub const USB_EPA_CTL: u16 = 0x2148;
pub const USB_EPA_MAXPKT: u16 = 0x2158;
pub const USB_EPA_MAXPKT_2: u16 = 0x215a;
pub const USB_EPA_FIFO_CFG: u16 = 0x2160;

// SYS block registers
pub const DEMOD_CTL: u16 = 0x3000;
pub const GPO: u16 = 0x3001;
pub const GPI: u16 = 0x3002;
pub const GPOE: u16 = 0x3003;
pub const GPD: u16 = 0x3004;
pub const SYSINTE: u16 = 0x3005;
pub const SYSINTS: u16 = 0x3006;
pub const GP_CFG0: u16 = 0x3007;
pub const GP_CFG1: u16 = 0x3008;
pub const SYSINTE_1: u16 = 0x3009;
pub const SYSINTS_1: u16 = 0x300a;
pub const DEMOD_CTL_1: u16 = 0x300b;
pub const IR_SUSPEND: u16 = 0x300c;

/// `wValue` for a paged demodulator register.
pub fn demod_value(addr: u16) -> u16 {
    (addr << 8) | DEMOD_SUBCMD
}

fn check_len(len: u8) -> Result<usize> {
    match len {
        1 | 2 => Ok(len as usize),
        _ => Err(Error::InvalidParam(format!(
            "register width must be 1 or 2 bytes, got {}",
            len
        ))),
    }
}

/// Wire layout of a register write: one byte is the low byte, two bytes go
/// high byte first.
fn reg_bytes(val: u16, len: usize) -> [u8; 2] {
    if len == 1 {
        [(val & 0xff) as u8, 0]
    } else {
        [(val >> 8) as u8, (val & 0xff) as u8]
    }
}

/// Register and I2C access for one device.
///
/// Single-threaded: the two phases of [`Bus::i2c_read_reg`] must not
/// interleave with another caller.
pub struct Bus<T> {
    transport: T,
}

impl<T: Transport> Bus<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Read raw bytes from a block.
    pub fn read_array(&self, block: Block, addr: u16, buf: &mut [u8]) -> Result<usize> {
        self.transport
            .read_control(CTRL_IN, 0, addr, block.read_index(), buf)
    }

    /// Write raw bytes to a block.
    pub fn write_array(&self, block: Block, addr: u16, data: &[u8]) -> Result<usize> {
        self.transport
            .write_control(CTRL_OUT, 0, addr, block.write_index(), data)
    }

    /// Read a 1 or 2 byte register (little-endian).
    pub fn read_reg(&self, block: Block, addr: u16, len: u8) -> Result<u16> {
        let len = check_len(len)?;
        let mut data = [0u8; 2];
        self.read_array(block, addr, &mut data[..len]).map_err(|e| {
            tracing::error!("read_reg {:?} {:#06x} failed: {}", block, addr, e);
            e
        })?;
        Ok(u16::from_le_bytes(data))
    }

    /// Write a 1 or 2 byte register.
    pub fn write_reg(&self, block: Block, addr: u16, val: u16, len: u8) -> Result<()> {
        let len = check_len(len)?;
        let data = reg_bytes(val, len);
        self.write_array(block, addr, &data[..len]).map_err(|e| {
            tracing::error!("write_reg {:?} {:#06x} failed: {}", block, addr, e);
            e
        })?;
        Ok(())
    }

    /// Read a paged demodulator register.
    pub fn demod_read_reg(&self, page: u8, addr: u16, len: u8) -> Result<u16> {
        let len = check_len(len)?;
        let mut data = [0u8; 2];
        self.transport
            .read_control(CTRL_IN, 0, demod_value(addr), page as u16, &mut data[..len])
            .map_err(|e| {
                tracing::error!("demod_read_reg page {} {:#04x} failed: {}", page, addr, e);
                e
            })?;
        Ok(u16::from_le_bytes(data))
    }

    /// Write a paged demodulator register.
    ///
    /// Every write is followed by a dummy read of page 0x0a register 0x01;
    /// the demodulator does not latch the write otherwise.
    pub fn demod_write_reg(&self, page: u8, addr: u16, val: u16, len: u8) -> Result<()> {
        let len = check_len(len)?;
        let data = reg_bytes(val, len);
        self.transport
            .write_control(
                CTRL_OUT,
                0,
                demod_value(addr),
                WRITE_FLAG | page as u16,
                &data[..len],
            )
            .map_err(|e| {
                tracing::error!("demod_write_reg page {} {:#04x} failed: {}", page, addr, e);
                e
            })?;

        self.demod_read_reg(0x0a, 0x01, 1)?;
        Ok(())
    }

    /// Raw I2C write through the IIC block.
    pub fn i2c_write(&self, i2c_addr: u8, data: &[u8]) -> Result<usize> {
        self.write_array(Block::Iic, i2c_addr as u16, data)
    }

    /// Raw I2C read through the IIC block.
    pub fn i2c_read(&self, i2c_addr: u8, buf: &mut [u8]) -> Result<usize> {
        self.read_array(Block::Iic, i2c_addr as u16, buf)
    }

    /// Write one register of an I2C device.
    pub fn i2c_write_reg(&self, i2c_addr: u8, reg: u8, val: u8) -> Result<()> {
        self.i2c_write(i2c_addr, &[reg, val])?;
        Ok(())
    }

    /// Read one register of an I2C device: address write, then a 1-byte read.
    pub fn i2c_read_reg(&self, i2c_addr: u8, reg: u8) -> Result<u8> {
        self.i2c_write(i2c_addr, &[reg])?;
        let mut data = [0u8; 1];
        self.i2c_read(i2c_addr, &mut data)?;
        Ok(data[0])
    }

    /// Drive GPIO `gpio` high or low.
    pub fn set_gpio_bit(&self, gpio: u8, on: bool) -> Result<()> {
        let mask = gpio_mask(gpio)?;
        let r = self.read_reg(Block::Sys, GPO, 1)?;
        let r = if on { r | mask } else { r & !mask };
        self.write_reg(Block::Sys, GPO, r, 1)
    }

    /// Configure GPIO `gpio` as an output.
    pub fn set_gpio_output(&self, gpio: u8) -> Result<()> {
        let mask = gpio_mask(gpio)?;
        let r = self.read_reg(Block::Sys, GPD, 1)?;
        self.write_reg(Block::Sys, GPD, r & !mask, 1)?;
        let r = self.read_reg(Block::Sys, GPOE, 1)?;
        self.write_reg(Block::Sys, GPOE, r | mask, 1)
    }

    /// Bridge (or unbridge) the I2C bus through to the tuner.
    pub fn set_i2c_repeater(&self, on: bool) -> Result<()> {
        self.demod_write_reg(1, 0x01, if on { 0x18 } else { 0x10 }, 1)
    }

    /// Run `f` with the I2C repeater open.
    ///
    /// The gate is closed afterwards whatever happened; the first error wins.
    pub fn with_repeater<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Self) -> Result<R>,
    {
        let result = self.set_i2c_repeater(true).and_then(|()| f(self));
        let closed = self.set_i2c_repeater(false);
        if let Err(e) = &closed {
            tracing::warn!("Failed to close I2C repeater: {}", e);
        }
        result.and_then(|r| closed.map(|()| r))
    }
}

/// The GPIO registers are 8 bits wide.
fn gpio_mask(gpio: u8) -> Result<u16> {
    if gpio > 7 {
        return Err(Error::InvalidParam(format!("GPIO {} does not exist", gpio)));
    }
    Ok(1 << gpio)
}
