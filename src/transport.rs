//! USB transport layer for RTL2832U devices.
//!
//! Everything the driver does to the hardware goes through the [`Transport`]
//! trait: vendor control transfers for register access, a blocking bulk read,
//! and a submit/complete pair for the streaming engine. [`UsbTransport`] is the
//! hardware implementation; tests substitute a recording mock.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nusb::transfer::{Bulk, In, TransferError};
use nusb::{Endpoint, Interface, MaybeFuture};
use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::devices::find_known_device;
use crate::error::{Error, Result};

/// Bulk IN endpoint carrying the sample stream.
pub const BULK_ENDPOINT: u8 = 0x81;

const INTERFACE: u8 = 0;

/// How long release waits for cancelled transfers to come back.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of a bulk transfer, mirroring libusb's transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Not yet completed (freshly allocated or resubmitted).
    Pending,
    /// Transfer completed without error.
    Completed,
    /// Transfer failed.
    Error,
    /// Transfer timed out.
    TimedOut,
    /// Transfer was cancelled.
    Cancelled,
    /// Endpoint stalled.
    Stall,
    /// Device was disconnected.
    NoDevice,
    /// Device sent more data than requested.
    Overflow,
}

impl From<TransferError> for TransferStatus {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => TransferStatus::Cancelled,
            TransferError::Stall => TransferStatus::Stall,
            TransferError::Disconnected => TransferStatus::NoDevice,
            _ => TransferStatus::Error,
        }
    }
}

/// One streaming buffer paired with its transfer bookkeeping.
///
/// The buffer is allocated once and travels between the pool and the
/// transport by value, so whoever holds the `Transfer` owns the memory.
#[derive(Debug)]
pub struct Transfer {
    slot: usize,
    endpoint: u8,
    buffer: Vec<u8>,
    actual_length: usize,
    status: TransferStatus,
}

impl Transfer {
    /// Allocate a zeroed transfer of `length` bytes for pool slot `slot`.
    pub fn new(slot: usize, endpoint: u8, length: usize) -> Self {
        Self {
            slot,
            endpoint,
            buffer: vec![0u8; length],
            actual_length: 0,
            status: TransferStatus::Pending,
        }
    }

    /// Pool slot this transfer belongs to.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Capacity of the underlying buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes received by the last completion.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }

    /// Whole buffer, for the transport to fill.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Mark the transfer completed with `actual_length` bytes received.
    pub fn complete(&mut self, actual_length: usize) {
        self.actual_length = actual_length.min(self.buffer.len());
        self.status = TransferStatus::Completed;
    }

    /// Mark the transfer finished with a non-success status.
    pub fn fail(&mut self, status: TransferStatus) {
        self.actual_length = 0;
        self.status = status;
    }

    /// Clear the completion state before resubmission.
    pub(crate) fn rearm(&mut self) {
        self.actual_length = 0;
        self.status = TransferStatus::Pending;
    }
}

/// A submission the transport refused; the transfer is handed back.
#[derive(Debug)]
pub struct Rejected {
    pub error: Error,
    pub transfer: Transfer,
}

/// Primitive operations the driver needs from a USB stack.
///
/// Implementations must be usable from a single thread; the device handle
/// never calls into its transport concurrently.
pub trait Transport: Send {
    /// Vendor control transfer, device to host. Returns bytes read.
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize>;

    /// Vendor control transfer, host to device. Returns bytes written.
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize>;

    /// Blocking bulk read.
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Queue an asynchronous bulk transfer. The transport owns it until it
    /// comes back from [`Transport::handle_events`].
    fn submit_bulk(&mut self, transfer: Transfer) -> std::result::Result<(), Rejected>;

    /// Wait up to `timeout` for transfer completions and return them.
    fn handle_events(&mut self, timeout: Duration) -> Result<Vec<Transfer>>;

    /// Release the claimed interface. Called once at close.
    fn release(&mut self) -> Result<()>;
}

/// Transport for a physical dongle.
///
/// Control transfers go through `rusb`. The bulk IN endpoint is claimed with
/// `nusb`, whose endpoint queue keeps every submitted transfer pending in the
/// kernel at once; [`Transport::handle_events`] reaps completions in
/// submission order.
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    control_timeout: Duration,
    bulk: Mutex<Option<BulkIn>>,
}

/// The claimed streaming interface and the transfers pending on it.
struct BulkIn {
    endpoint: Endpoint<Bulk, In>,
    /// Pending transfers, oldest first; completions arrive in this order.
    in_flight: VecDeque<Transfer>,
    _interface: Interface,
}

impl BulkIn {
    fn claim(device: &Device<Context>) -> Result<Self> {
        let (bus, address) = (device.bus_number(), device.address());
        let info = nusb::list_devices()
            .wait()
            .map_err(|e| Error::ClaimFailed(e.to_string()))?
            .find(|info| same_location(info, bus, address))
            .ok_or_else(|| {
                Error::ClaimFailed(format!("bus {:03} device {:03} vanished", bus, address))
            })?;

        let usb = info.open().wait().map_err(|e| {
            tracing::error!("usb_open error {}", e);
            Error::ClaimFailed(e.to_string())
        })?;
        // detaches the DVB kernel driver where one is bound
        let interface = usb.detach_and_claim_interface(INTERFACE).wait().map_err(|e| {
            tracing::error!("usb_claim_interface error {}", e);
            Error::ClaimFailed(e.to_string())
        })?;
        let endpoint = interface
            .endpoint::<Bulk, In>(BULK_ENDPOINT)
            .map_err(|e| Error::ClaimFailed(format!("endpoint {:#04x}: {}", BULK_ENDPOINT, e)))?;

        Ok(Self {
            endpoint,
            in_flight: VecDeque::new(),
            _interface: interface,
        })
    }

    /// Cancel whatever is pending and wait for the kernel to hand it back.
    fn drain(&mut self, timeout: Duration) {
        self.endpoint.cancel_all();
        while self.endpoint.pending() > 0 {
            if self.endpoint.wait_next_complete(timeout).is_none() {
                tracing::warn!("{} bulk transfers did not return", self.endpoint.pending());
                break;
            }
        }
        self.in_flight.clear();
    }
}

fn same_location(info: &nusb::DeviceInfo, bus: u8, address: u8) -> bool {
    #[cfg(target_os = "linux")]
    let same_bus = info.busnum() == bus;
    #[cfg(not(target_os = "linux"))]
    let same_bus = info.bus_id().parse::<u8>().map_or(true, |id| id == bus);

    same_bus && info.device_address() == address
}

/// Copy a completed `nusb` buffer into its transfer.
fn finish(transfer: &mut Transfer, completion: nusb::transfer::Completion) {
    match completion.status {
        Ok(()) => {
            let n = completion.buffer.len().min(transfer.len());
            transfer.buffer_mut()[..n].copy_from_slice(&completion.buffer[..n]);
            transfer.complete(n);
        }
        Err(e) => {
            tracing::debug!("bulk transfer on slot {} failed: {}", transfer.slot(), e);
            transfer.fail(e.into());
        }
    }
}

impl UsbTransport {
    /// Open the `index`-th supported device (in enumeration order).
    ///
    /// Open sequence:
    /// 1. Find the device among the known VID/PID pairs
    /// 2. Open it for control transfers
    /// 3. Detach the kernel driver and claim interface 0 with its bulk endpoint
    pub fn open(index: u32, control_timeout: Duration) -> Result<Self> {
        let context = Context::new()?;
        let devices = context.devices()?;

        let mut count = 0;
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };

            if find_known_device(desc.vendor_id(), desc.product_id()).is_some() {
                if count == index {
                    return Self::open_device(&device, control_timeout);
                }
                count += 1;
            }
        }

        Err(Error::DeviceNotFound(index))
    }

    fn open_device(device: &Device<Context>, control_timeout: Duration) -> Result<Self> {
        let handle = device.open().map_err(|e| {
            tracing::error!("usb_open error {}", e);
            e
        })?;
        let bulk = BulkIn::claim(device)?;

        Ok(UsbTransport {
            handle,
            control_timeout,
            bulk: Mutex::new(Some(bulk)),
        })
    }

    fn bulk(&self) -> MutexGuard<'_, Option<BulkIn>> {
        self.bulk.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bulk_mut(&mut self) -> Option<&mut BulkIn> {
        self.bulk
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
    }
}

impl Transport for UsbTransport {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.handle
            .read_control(request_type, request, value, index, buf, self.control_timeout)
            .map_err(|e| {
                Error::ControlTransferFailed(format!(
                    "IN value={:#06x} index={:#06x}: {}",
                    value, index, e
                ))
            })
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize> {
        self.handle
            .write_control(request_type, request, value, index, data, self.control_timeout)
            .map_err(|e| {
                Error::ControlTransferFailed(format!(
                    "OUT value={:#06x} index={:#06x}: {}",
                    value, index, e
                ))
            })
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if endpoint != BULK_ENDPOINT {
            return Err(Error::InvalidParam(format!("no bulk endpoint {:#04x}", endpoint)));
        }
        let mut guard = self.bulk();
        let bulk = guard.as_mut().ok_or(Error::Usb(rusb::Error::NoDevice))?;
        if !bulk.in_flight.is_empty() {
            return Err(Error::StreamingError(format!(
                "{} asynchronous transfers still pending",
                bulk.in_flight.len()
            )));
        }

        let buffer = bulk.endpoint.allocate(buf.len());
        bulk.endpoint.submit(buffer);
        let Some(completion) = bulk.endpoint.wait_next_complete(timeout) else {
            bulk.drain(timeout);
            return Err(Error::Usb(rusb::Error::Timeout));
        };

        completion
            .status
            .map_err(|e| Error::StreamingError(format!("bulk read failed: {}", e)))?;
        let n = completion.buffer.len().min(buf.len());
        buf[..n].copy_from_slice(&completion.buffer[..n]);
        Ok(n)
    }

    fn submit_bulk(&mut self, transfer: Transfer) -> std::result::Result<(), Rejected> {
        if transfer.endpoint() != BULK_ENDPOINT {
            return Err(Rejected {
                error: Error::InvalidParam(format!("no bulk endpoint {:#04x}", transfer.endpoint())),
                transfer,
            });
        }
        let Some(bulk) = self.bulk_mut() else {
            return Err(Rejected {
                error: Error::Usb(rusb::Error::NoDevice),
                transfer,
            });
        };

        let buffer = bulk.endpoint.allocate(transfer.len());
        bulk.endpoint.submit(buffer);
        bulk.in_flight.push_back(transfer);
        Ok(())
    }

    fn handle_events(&mut self, timeout: Duration) -> Result<Vec<Transfer>> {
        let bulk = match self.bulk_mut() {
            Some(bulk) if !bulk.in_flight.is_empty() => bulk,
            _ => {
                std::thread::sleep(timeout);
                return Ok(Vec::new());
            }
        };

        // block for the first completion, then collect whatever else is ready
        let mut completed = Vec::new();
        let mut wait = timeout;
        while !bulk.in_flight.is_empty() {
            let Some(completion) = bulk.endpoint.wait_next_complete(wait) else {
                break;
            };
            let Some(mut transfer) = bulk.in_flight.pop_front() else {
                break;
            };
            finish(&mut transfer, completion);
            completed.push(transfer);
            wait = Duration::ZERO;
        }
        Ok(completed)
    }

    fn release(&mut self) -> Result<()> {
        let bulk = self
            .bulk
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // dropping the claim releases interface 0
        if let Some(mut bulk) = bulk {
            bulk.drain(RELEASE_TIMEOUT);
        }
        Ok(())
    }
}
