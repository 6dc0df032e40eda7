//! Asynchronous bulk streaming.
//!
//! A fixed pool of transfers is kept in flight on the bulk endpoint. Every
//! completed transfer is handed to the application callback and immediately
//! resubmitted, so the device never runs out of buffers while the callback
//! keeps up. The loop runs until cancelled through a [`Canceller`].
//!
//! Cancellation is cooperative: the flag is checked each time the transport's
//! event wait returns, so a stop takes effect within one event timeout
//! ([`crate::DeviceConfig::event_timeout`]). Transfers already submitted are
//! not aborted; they stay with the transport and are picked up again by the
//! next streaming session or released at close.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::transport::{Rejected, Transfer, TransferStatus, Transport, BULK_ENDPOINT};

/// Lifecycle of one pool slot.
#[derive(Debug)]
pub enum SlotState {
    /// Allocated, owned by the pool, not submitted.
    Idle(Transfer),
    /// Submitted; the transport owns the transfer.
    InFlight,
    /// Ended with a failed completion or a refused resubmission.
    Dropped(Transfer),
}

impl SlotState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SlotState::InFlight)
    }
}

/// The streaming transfers of one device.
#[derive(Debug, Default)]
pub struct TransferPool {
    slots: Vec<SlotState>,
}

impl TransferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_allocated(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Allocate `count` transfers of `length` bytes, unless already allocated.
    pub fn allocate(&mut self, count: usize, length: usize) {
        if self.is_allocated() {
            return;
        }
        self.slots = (0..count)
            .map(|slot| SlotState::Idle(Transfer::new(slot, BULK_ENDPOINT, length)))
            .collect();
        tracing::debug!("Allocated {} transfers of {} bytes", count, length);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&SlotState> {
        self.slots.get(index)
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.is_in_flight()).count()
    }

    /// Submit every slot the pool currently holds. Returns how many went out.
    pub fn submit_all<T: Transport>(&mut self, transport: &mut T) -> Result<usize> {
        let mut submitted = 0;
        for slot in self.slots.iter_mut() {
            let mut transfer = match std::mem::replace(slot, SlotState::InFlight) {
                SlotState::Idle(t) | SlotState::Dropped(t) => t,
                SlotState::InFlight => continue,
            };
            transfer.rearm();
            if let Err(Rejected { error, transfer }) = transport.submit_bulk(transfer) {
                tracing::error!("Failed to submit transfer {}: {}", transfer.slot(), error);
                *slot = SlotState::Dropped(transfer);
                return Err(error);
            }
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Handle one completion: forward and resubmit on success, drop otherwise.
    pub fn complete<T, F>(&mut self, mut transfer: Transfer, transport: &mut T, callback: &mut F)
    where
        T: Transport,
        F: FnMut(&[u8]),
    {
        let index = transfer.slot();
        let Some(slot) = self.slots.get_mut(index) else {
            tracing::warn!("Completion for unknown transfer slot {}", index);
            return;
        };
        if !slot.is_in_flight() {
            tracing::warn!("Completion for transfer {} which was not in flight", index);
            *slot = SlotState::Idle(transfer);
            return;
        }

        if transfer.status() != TransferStatus::Completed {
            tracing::warn!(
                "Transfer {} ended with status {:?}, not resubmitting",
                index,
                transfer.status()
            );
            *slot = SlotState::Dropped(transfer);
            return;
        }

        callback(transfer.data());

        transfer.rearm();
        if let Err(Rejected { error, transfer }) = transport.submit_bulk(transfer) {
            tracing::error!("Failed to resubmit transfer {}: {}", index, error);
            *slot = SlotState::Dropped(transfer);
        }
    }
}

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const RUNNING: u8 = 2;
const STOPPING: u8 = 3;

/// Stops a running [`crate::RtlSdr::read_async`] from any thread.
///
/// A handle can also be armed ahead of a session that is about to start; a
/// cancel issued in between is then kept and the session returns at once.
#[derive(Debug, Clone)]
pub struct Canceller {
    state: Arc<AtomicU8>,
}

impl Canceller {
    pub(crate) fn new(state: Arc<AtomicU8>) -> Self {
        Self { state }
    }

    /// Mark a session as about to start so that an early cancel sticks.
    pub(crate) fn arm(&self) {
        let _ = self
            .state
            .compare_exchange(IDLE, ARMED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Ask the streaming loop to stop.
    ///
    /// Returns [`Error::NotRunning`] if no loop was running or armed.
    pub fn cancel(&self) -> Result<()> {
        for from in [RUNNING, ARMED] {
            if self
                .state
                .compare_exchange(from, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                tracing::debug!("Asynchronous streaming cancelled");
                return Ok(());
            }
        }
        Err(Error::NotRunning)
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Enter the running state. Returns false if a cancel came first.
    fn start(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::SeqCst);
            if current == STOPPING {
                self.state.store(IDLE, Ordering::SeqCst);
                return false;
            }
            if self
                .state
                .compare_exchange(current, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn finish(&self) {
        self.state.store(IDLE, Ordering::SeqCst);
    }
}

/// Pool plus streaming state; the device handle owns one.
#[derive(Debug, Default)]
pub struct StreamEngine {
    pool: TransferPool,
    state: Arc<AtomicU8>,
}

impl StreamEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canceller(&self) -> Canceller {
        Canceller::new(self.state.clone())
    }

    pub fn pool(&self) -> &TransferPool {
        &self.pool
    }

    /// Stream until cancelled, the transport fails, or every transfer drops.
    pub fn run<T, F>(&mut self, transport: &mut T, config: &DeviceConfig, mut callback: F) -> Result<()>
    where
        T: Transport,
        F: FnMut(&[u8]),
    {
        let canceller = self.canceller();
        if !canceller.start() {
            tracing::debug!("Streaming cancelled before it started");
            return Ok(());
        }

        if config.buf_num == 0 || config.buf_len == 0 {
            canceller.finish();
            return Err(Error::InvalidParam(
                "streaming needs at least one non-empty buffer".to_string(),
            ));
        }

        self.pool.allocate(config.buf_num, config.buf_len);
        let submitted = match self.pool.submit_all(transport) {
            Ok(n) => n,
            Err(e) => {
                canceller.finish();
                return Err(e);
            }
        };
        tracing::debug!("Submitted {} transfers", submitted);

        let result = loop {
            if !canceller.is_running() {
                break Ok(());
            }

            match transport.handle_events(config.event_timeout) {
                Ok(completed) => {
                    for transfer in completed {
                        self.pool.complete(transfer, transport, &mut callback);
                    }
                }
                Err(e) => {
                    tracing::error!("Event handling failed: {}", e);
                    break Err(e);
                }
            }

            if self.pool.in_flight() == 0 {
                tracing::error!("All transfers dropped, stopping stream");
                break Err(Error::StreamStalled);
            }
        };

        canceller.finish();
        result
    }
}
