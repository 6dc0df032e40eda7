//! Test helpers: a recording mock transport and tuner
//!
//! The mock models just enough of the dongle for the driver to run: I2C
//! reads answer from a register map only while the repeater gate is open, SYS
//! registers remember what was written, and bulk transfers complete from a
//! script. Every call lands in a shared journal.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::f32::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rs_rtl::transport::Rejected;
use rs_rtl::tuner::TunerBus;
use rs_rtl::{
    DeviceConfig, Error, Result, RtlSdr, Transfer, TransferStatus, Transport, Tuner,
    TunerFactory, TunerFamily,
};

/// Demod page 1 register 0x01, as sent on the wire.
pub const GATE_VALUE: u16 = 0x0120;
pub const GATE_INDEX: u16 = 0x0011;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunerCall {
    Init,
    Exit,
    Tune(u32),
    SetBandwidth(u32),
    SetGain(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ReadControl { value: u16, index: u16, len: usize },
    WriteControl { value: u16, index: u16, data: Vec<u8> },
    ReadBulk { len: usize },
    Submit { slot: usize },
    Release,
    /// Tuner driver call and whether the gate was open at the time.
    Tuner { call: TunerCall, gate_open: bool },
}

impl Event {
    pub fn write(value: u16, index: u16, data: &[u8]) -> Self {
        Event::WriteControl {
            value,
            index,
            data: data.to_vec(),
        }
    }

    pub fn gate(on: bool) -> Self {
        Event::write(GATE_VALUE, GATE_INDEX, &[if on { 0x18 } else { 0x10 }])
    }

    pub fn is_gate(&self) -> bool {
        matches!(self, Event::WriteControl { value: GATE_VALUE, index: GATE_INDEX, .. })
    }

    pub fn is_demod_dummy_read(&self) -> bool {
        *self
            == Event::ReadControl {
                value: 0x0120,
                index: 0x000a,
                len: 1,
            }
    }
}

/// Scripted outcome of the next in-flight transfer.
#[derive(Debug, Clone)]
pub enum Completion {
    Data(Vec<u8>),
    Fail(TransferStatus),
}

#[derive(Default)]
pub struct MockState {
    pub events: Vec<Event>,
    pub gate_open: bool,
    pub i2c_regs: HashMap<(u8, u8), u8>,
    pending_reg: HashMap<u8, u8>,
    pub sys_regs: HashMap<u16, u8>,
    pub bulk_chunks: VecDeque<Vec<u8>>,
    pub completions: VecDeque<Completion>,
    in_flight: VecDeque<Transfer>,
    pub fail_writes: bool,
    pub fail_events: bool,
    pub refuse_submit: bool,
    pub fail_init: bool,
    pub fail_tune: bool,
    pub fail_bandwidth: bool,
    pub fail_gain: bool,
}

/// Shared handle on the mock's state.
#[derive(Clone, Default)]
pub struct Mock(Arc<Mutex<MockState>>);

impl Mock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock with the identification register of `family` answering.
    pub fn with_tuner(family: TunerFamily) -> Self {
        let mock = Self::new();
        let desc = family.descriptor();
        mock.set_i2c(desc.i2c_addr, desc.check_addr, desc.check_val);
        mock
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    pub fn set_i2c(&self, addr: u8, reg: u8, val: u8) {
        self.state().i2c_regs.insert((addr, reg), val);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn clear(&self) {
        self.state().events.clear();
    }

    pub fn script(&self, completion: Completion) {
        self.state().completions.push_back(completion);
    }

    pub fn tuner_calls(&self) -> Vec<TunerCall> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Tuner { call, .. } => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn submitted_slots(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Submit { slot } => Some(slot),
                _ => None,
            })
            .collect()
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport { mock: self.clone() }
    }

    pub fn tuners(&self) -> MockTuners {
        MockTuners { mock: self.clone() }
    }

    /// Open a device handle over this mock.
    pub fn open(&self, config: DeviceConfig) -> Result<RtlSdr<MockTransport>> {
        RtlSdr::from_transport(self.transport(), config, &self.tuners())
    }
}

/// Small pool and short event timeout for streaming tests.
pub fn test_config() -> DeviceConfig {
    DeviceConfig {
        buf_num: 4,
        buf_len: 512,
        event_timeout: Duration::from_millis(20),
        ..DeviceConfig::default()
    }
}

fn nak(what: &str) -> Error {
    Error::ControlTransferFailed(format!("mock: {}", what))
}

pub struct MockTransport {
    mock: Mock,
}

impl Transport for MockTransport {
    fn read_control(
        &self,
        _request_type: u8,
        _request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        let mut state = self.mock.state();
        state.events.push(Event::ReadControl {
            value,
            index,
            len: buf.len(),
        });

        buf.fill(0);
        match index {
            // IIC block
            0x0600 => {
                if !state.gate_open {
                    return Err(nak("i2c read with gate closed"));
                }
                let addr = value as u8;
                let reg = state.pending_reg.get(&addr).copied().unwrap_or(0);
                match state.i2c_regs.get(&(addr, reg)) {
                    Some(&val) => buf[0] = val,
                    None => return Err(nak("i2c read not acknowledged")),
                }
            }
            // SYS block
            0x0200 => {
                buf[0] = state.sys_regs.get(&value).copied().unwrap_or(0);
            }
            _ => {}
        }
        Ok(buf.len())
    }

    fn write_control(
        &self,
        _request_type: u8,
        _request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize> {
        let mut state = self.mock.state();
        state.events.push(Event::write(value, index, data));

        if state.fail_writes {
            return Err(nak("write failed"));
        }

        match index {
            0x0610 => {
                if !state.gate_open {
                    return Err(nak("i2c write with gate closed"));
                }
                let addr = value as u8;
                match *data {
                    [reg] => {
                        state.pending_reg.insert(addr, reg);
                    }
                    [reg, val, ..] => {
                        state.i2c_regs.insert((addr, reg), val);
                    }
                    [] => {}
                }
            }
            0x0210 => {
                state.sys_regs.insert(value, data[0]);
            }
            GATE_INDEX if value == GATE_VALUE => {
                state.gate_open = data[0] == 0x18;
            }
            _ => {}
        }
        Ok(data.len())
    }

    fn read_bulk(&self, _endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.mock.state();
        state.events.push(Event::ReadBulk { len: buf.len() });
        match state.bulk_chunks.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn submit_bulk(&mut self, transfer: Transfer) -> std::result::Result<(), Rejected> {
        let mut state = self.mock.state();
        if state.refuse_submit {
            return Err(Rejected {
                error: Error::StreamingError("mock: submit refused".to_string()),
                transfer,
            });
        }
        state.events.push(Event::Submit {
            slot: transfer.slot(),
        });
        state.in_flight.push_back(transfer);
        Ok(())
    }

    fn handle_events(&mut self, timeout: Duration) -> Result<Vec<Transfer>> {
        let next = {
            let mut state = self.mock.state();
            if state.fail_events {
                return Err(Error::StreamingError("mock: event handling failed".to_string()));
            }
            match state.completions.pop_front() {
                Some(completion) => state
                    .in_flight
                    .pop_front()
                    .map(|transfer| (transfer, completion)),
                None => None,
            }
        };

        let Some((mut transfer, completion)) = next else {
            std::thread::sleep(timeout);
            return Ok(Vec::new());
        };

        match completion {
            Completion::Data(data) => {
                let n = data.len().min(transfer.len());
                transfer.buffer_mut()[..n].copy_from_slice(&data[..n]);
                transfer.complete(n);
            }
            Completion::Fail(status) => transfer.fail(status),
        }
        Ok(vec![transfer])
    }

    fn release(&mut self) -> Result<()> {
        let mut state = self.mock.state();
        state.in_flight.clear();
        state.events.push(Event::Release);
        Ok(())
    }
}

pub struct MockTuners {
    mock: Mock,
}

impl TunerFactory for MockTuners {
    fn create(&self, family: TunerFamily) -> Box<dyn Tuner> {
        Box::new(MockTuner {
            family,
            mock: self.mock.clone(),
        })
    }
}

pub struct MockTuner {
    family: TunerFamily,
    mock: Mock,
}

impl MockTuner {
    fn record(&self, call: TunerCall, fail: bool) -> Result<()> {
        let mut state = self.mock.state();
        let gate_open = state.gate_open;
        state.events.push(Event::Tuner { call, gate_open });
        if fail {
            Err(Error::tuner(self.family, "mock failure"))
        } else {
            Ok(())
        }
    }
}

impl Tuner for MockTuner {
    fn init(&mut self, _bus: &dyn TunerBus) -> Result<()> {
        let fail = self.mock.state().fail_init;
        self.record(TunerCall::Init, fail)
    }

    fn exit(&mut self, _bus: &dyn TunerBus) -> Result<()> {
        self.record(TunerCall::Exit, false)
    }

    fn tune(&mut self, _bus: &dyn TunerBus, freq_hz: u32) -> Result<()> {
        let fail = self.mock.state().fail_tune;
        self.record(TunerCall::Tune(freq_hz), fail)
    }

    fn set_bandwidth(&mut self, _bus: &dyn TunerBus, bandwidth_hz: u32) -> Result<()> {
        let fail = self.mock.state().fail_bandwidth;
        self.record(TunerCall::SetBandwidth(bandwidth_hz), fail)
    }

    fn set_gain(&mut self, _bus: &dyn TunerBus, gain_db: i32) -> Result<()> {
        let fail = self.mock.state().fail_gain;
        self.record(TunerCall::SetGain(gain_db), fail)
    }
}

/// Generate a complex sine wave as interleaved unsigned 8-bit I/Q bytes
///
/// # Arguments
/// * `frequency` - Frequency in Hz
/// * `sample_rate` - Sample rate in Hz
/// * `num_samples` - Number of samples to generate
pub fn generate_sine_wave_cu8(frequency: f32, sample_rate: u32, num_samples: usize) -> Vec<u8> {
    let angular_freq = 2.0 * PI * frequency / sample_rate as f32;

    (0..num_samples)
        .flat_map(|n| {
            let phase = angular_freq * n as f32;
            // [-1, 1] to [0, 255]
            [
                ((phase.cos() + 1.0) * 127.5) as u8,
                ((phase.sin() + 1.0) * 127.5) as u8,
            ]
        })
        .collect()
}

/// Index of the first event equal to `event`.
pub fn position(events: &[Event], event: &Event) -> Option<usize> {
    events.iter().position(|e| e == event)
}
