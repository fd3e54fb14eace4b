//! The SPI engine: slave discovery and the steady-state polling loop.
//!
//! The engine owns the bus handle and runs on its own OS thread. Packets
//! are exchanged with the slaves every 500 us (configurable). If there
//! is nothing to send, the loop cycles through the slaves and polls for
//! data; if the outbound queue is non-empty, the slave that ought to
//! receive the head of the queue gets the slot instead. Prioritizing
//! sends this way greatly reduces latency in a big stack.
//!
//! The cadence is paced by an absolute deadline against the monotonic
//! clock: the deadline advances by one interval per tick and the sleep
//! returns immediately when the loop is already late, so a slow tick is
//! caught up instead of accumulating drift.
//!
//! Every failure is contained within one tick; nothing propagates out of
//! the loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::bridge::BridgeSender;
use crate::config::SpiStackConfig;
use crate::packet::Packet;
use crate::spi::bus::SpiBus;
use crate::spi::frame::{decode_frame, empty_frame, encode_frame, FrameRead, FRAME_SIZE};
use crate::spi::slave::{SlaveStatus, MAX_SLAVES};
use crate::spi::stack::{lock_state, SharedState};
use crate::util::base58_encode;

/// Send half of one transaction, mirroring the frame-level failure
/// semantics: only `Sent` pops the queue, `Busy` retries next tick and
/// `Error` drops the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendStatus {
    /// There was nothing to send; an empty poll frame went out.
    None,
    /// The slave signalled busy earlier; an empty frame went out instead
    /// of the queued packet.
    Busy,
    /// The queued packet went out on the wire.
    Sent,
    /// The queued packet could not be sent (oversize, absent slave,
    /// transfer failure) and must be dropped.
    Error,
}

/// Read half of one transaction.
#[derive(Debug)]
enum ReadStatus {
    /// No transfer took place this tick.
    Skipped,
    /// Quiet line; the slave exchanged no frame.
    Quiet,
    /// Valid empty frame.
    Empty { busy: bool },
    /// A packet arrived.
    Received { packet: Packet, busy: bool },
    /// The received buffer was discarded.
    Error,
}

/// The polling engine. Constructed on the event-loop thread, consumed by
/// [`SpiEngine::run`] on the dedicated SPI thread.
pub(crate) struct SpiEngine {
    config: SpiStackConfig,
    bus: Box<dyn SpiBus>,
    state: Arc<SharedState>,
    bridge: BridgeSender,
}

impl SpiEngine {
    pub(crate) fn new(
        config: SpiStackConfig,
        bus: Box<dyn SpiBus>,
        state: Arc<SharedState>,
        bridge: BridgeSender,
    ) -> Self {
        Self {
            config,
            bus,
            state,
            bridge,
        }
    }

    /// Thread entry point: discover the slaves, then poll until the
    /// running flag clears. The bus handle is dropped (and the SPI
    /// device closed) only after the loop has returned.
    pub(crate) fn run(mut self) {
        self.enumerate();

        if !self.state.running.load(Ordering::SeqCst) {
            return;
        }

        let slave_num = lock_state(&self.state.inner).table.slave_num();
        if slave_num == 0 {
            info!("Shutting SPI stack thread down, there are no SPI slaves");
            return;
        }

        let mut cycle = 0usize;
        let mut deadline = Instant::now();

        while self.state.running.load(Ordering::SeqCst) {
            self.tick(&mut cycle, slave_num);

            deadline += self.config.poll_interval();
            let wait = deadline.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }

        debug!("SPI stack thread shutting down");
    }

    // ------------------------------------------------------------------
    // Steady state
    // ------------------------------------------------------------------

    fn tick(&mut self, cycle: &mut usize, slave_num: usize) {
        // Peek the queue under its mutex; never hold the lock across the
        // transfer. A queued send always wins over round-robin polling.
        let (slave_index, request, status) = {
            let state = lock_state(&self.state.inner);
            match state.queue.front() {
                Some(entry) => {
                    let status = state
                        .table
                        .get(entry.slave_index)
                        .map(|slave| slave.status())
                        .unwrap_or(SlaveStatus::Absent);
                    (entry.slave_index, Some(entry.packet.clone()), status)
                }
                None => {
                    *cycle = (*cycle + 1) % slave_num;
                    (*cycle, None, SlaveStatus::Available)
                }
            }
        };

        let (send, read) = self.transceive(request.as_ref(), slave_index, status);

        let received = {
            let mut state = lock_state(&self.state.inner);

            match send {
                // Sent: done with the head entry. Error: dropped, not
                // retried; other traffic is unaffected.
                SendStatus::Sent | SendStatus::Error => {
                    state.queue.pop_front();
                }
                SendStatus::Busy | SendStatus::None => {}
            }

            match read {
                ReadStatus::Empty { busy } => {
                    state.table.mark_busy(slave_index, busy);
                    None
                }
                ReadStatus::Received { packet, busy } => {
                    state.table.mark_busy(slave_index, busy);
                    Some(packet)
                }
                ReadStatus::Skipped | ReadStatus::Quiet | ReadStatus::Error => None,
            }
        };

        // Dispatch outside the critical section: the bridge send blocks
        // until the event loop has consumed the previous packet.
        if let Some(mut packet) = received {
            let stack_address = slave_index as u8;
            packet.patch_enumerate_position(stack_address, self.config.master_uid);

            debug!("Received packet over SPI {}", packet);
            if self.bridge.send_blocking(packet).is_err() {
                error!("Event bridge closed, dropping packet received over SPI");
            }
        }
    }

    // ------------------------------------------------------------------
    // Enumeration
    // ------------------------------------------------------------------

    /// Walk the stack addresses and build the routing table. Discovery
    /// ends at the first address that exhausts its retry budget, so the
    /// present slaves always form a contiguous prefix.
    fn enumerate(&mut self) {
        debug!("Starting to discover SPI stack slaves");

        let request = Packet::stack_enumerate_request();
        let mut address = 0usize;
        let mut uid_total = 0usize;

        while address < MAX_SLAVES && self.state.running.load(Ordering::SeqCst) {
            // Assume the slave is available and see if we get an answer.
            lock_state(&self.state.inner)
                .table
                .set_status(address, SlaveStatus::Available);

            if !self.enumerate_send(&request, address) || !self.enumerate_receive(address, &mut uid_total) {
                lock_state(&self.state.inner)
                    .table
                    .set_status(address, SlaveStatus::Absent);
                break;
            }

            address += 1;
        }

        if !self.state.running.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut state = lock_state(&self.state.inner);
            state.table.set_slave_num(address);
            state.enumerated = true;
        }

        info!(
            "SPI stack slave discovery done, found {} slave(s) with {} UID(s) in total",
            address, uid_total
        );
    }

    /// Transmit the enumerate request until it goes out on the wire.
    fn enumerate_send(&mut self, request: &Packet, address: usize) -> bool {
        for _ in 0..self.config.enumerate_tries {
            if !self.state.running.load(Ordering::SeqCst) {
                return false;
            }

            let status = self.slave_status(address);
            let (send, read) = self.transceive(Some(request), address, status);
            self.apply_busy(address, &read);

            if send == SendStatus::Sent {
                return true;
            }

            // Give the slave some more time.
            thread::sleep(self.config.enumerate_wait());
        }

        false
    }

    /// Poll for the enumerate response and record the reported UIDs.
    fn enumerate_receive(&mut self, address: usize, uid_total: &mut usize) -> bool {
        for _ in 0..self.config.enumerate_tries {
            if !self.state.running.load(Ordering::SeqCst) {
                return false;
            }

            // Sleep first so there is some time between the request and
            // the attempt to fetch the answer.
            thread::sleep(self.config.enumerate_wait());

            let status = self.slave_status(address);
            let (_, read) = self.transceive(None, address, status);
            self.apply_busy(address, &read);

            if let ReadStatus::Received { packet, .. } = read {
                let uids = packet.enumerate_uids();
                for uid in &uids {
                    debug!(
                        "Found UID {} of slave {}",
                        base58_encode(*uid),
                        address
                    );
                }

                *uid_total += uids.len();
                lock_state(&self.state.inner).table.record_uids(address, &uids);
                return true;
            }
        }

        false
    }

    fn slave_status(&self, address: usize) -> SlaveStatus {
        lock_state(&self.state.inner)
            .table
            .get(address)
            .map(|slave| slave.status())
            .unwrap_or(SlaveStatus::Absent)
    }

    fn apply_busy(&self, address: usize, read: &ReadStatus) {
        let busy = match read {
            ReadStatus::Empty { busy } => *busy,
            ReadStatus::Received { busy, .. } => *busy,
            _ => return,
        };
        lock_state(&self.state.inner).table.mark_busy(address, busy);
    }

    // ------------------------------------------------------------------
    // Transceive
    // ------------------------------------------------------------------

    /// One full-duplex bus transaction with the slave at `slave_index`.
    ///
    /// With no request, or with the slave known busy, the empty poll
    /// frame goes out and the queued packet (if any) stays put for the
    /// next tick. The slave status is *not* updated here; the caller
    /// applies the returned busy bit under the state lock.
    fn transceive(
        &mut self,
        request: Option<&Packet>,
        slave_index: usize,
        status: SlaveStatus,
    ) -> (SendStatus, ReadStatus) {
        let (send, tx) = match (request, status) {
            (None, _) => (SendStatus::None, empty_frame()),
            (Some(_), SlaveStatus::AvailableBusy) => (SendStatus::Busy, empty_frame()),
            (Some(packet), SlaveStatus::Available) => match encode_frame(Some(packet), false) {
                Ok(tx) => (SendStatus::Sent, tx),
                Err(err) => {
                    error!("Dropping request for slave {}: {}", slave_index, err);
                    return (SendStatus::Error, ReadStatus::Skipped);
                }
            },
            (Some(_), SlaveStatus::Absent) => {
                error!(
                    "Slave with stack address {} is not present in stack",
                    slave_index
                );
                return (SendStatus::Error, ReadStatus::Skipped);
            }
        };

        let mut rx = [0u8; FRAME_SIZE];
        if let Err(err) = self.bus.transfer(slave_index as u8, &tx, &mut rx) {
            error!("SPI transfer with slave {} failed: {}", slave_index, err);
            let send = match send {
                // The queued packet did not make it out; drop it.
                SendStatus::Sent => SendStatus::Error,
                other => other,
            };
            return (send, ReadStatus::Error);
        }

        let read = match decode_frame(&rx) {
            Ok(FrameRead::Quiet) => {
                debug!("Slave {} stayed quiet", slave_index);
                ReadStatus::Quiet
            }
            Ok(FrameRead::Empty { busy }) => ReadStatus::Empty { busy },
            Ok(FrameRead::Packet { packet, busy }) => ReadStatus::Received { packet, busy },
            Err(err) => {
                error!("Received frame from slave {} rejected: {}", slave_index, err);
                ReadStatus::Error
            }
        };

        (send, read)
    }
}
