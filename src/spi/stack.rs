//! The SPI stack transport.
//!
//! [`SpiStack`] ties the pieces together: it owns the outbound queue and
//! the slave table, implements the router-facing [`Stack`] interface,
//! and manages the lifetime of the engine thread.
//!
//! Locking model: the queue and the slave table share one mutex, held
//! only for push/peek/pop and status updates, never across I/O. The
//! table is written only by the engine thread (during enumeration and on
//! status flips) and becomes read-only for routing purposes once
//! enumeration completes; the router resolves `find_by_uid` inside the
//! same critical section that pushes the queue entry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::thread::JoinHandle;

use tracing::{debug, error};

use crate::bridge::{event_bridge, BridgeReceiver};
use crate::config::SpiStackConfig;
use crate::error::Result;
use crate::packet::Packet;
use crate::router::Stack;
use crate::spi::bus::SpiBus;
use crate::spi::engine::SpiEngine;
use crate::spi::slave::SlaveTable;

/// Name the transport registers under.
pub const SPI_STACK_NAME: &str = "spi_stack";

/// One queued outbound request: the target slave and a copy of the
/// packet. Broadcasts become one entry per present slave.
pub(crate) struct QueuedRequest {
    pub(crate) slave_index: usize,
    pub(crate) packet: Packet,
}

/// State shared between the event-loop side and the engine thread,
/// guarded by one mutex.
pub(crate) struct StackState {
    pub(crate) queue: VecDeque<QueuedRequest>,
    pub(crate) table: SlaveTable,
    pub(crate) enumerated: bool,
}

/// Mutex-guarded state plus the engine running flag.
pub(crate) struct SharedState {
    pub(crate) inner: Mutex<StackState>,
    pub(crate) running: AtomicBool,
}

/// Lock the shared state, recovering from poisoning; nothing behind the
/// lock is left in an inconsistent state by a panicking holder.
pub(crate) fn lock_state(state: &Mutex<StackState>) -> MutexGuard<'_, StackState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The SPI stack transport.
pub struct SpiStack {
    name: String,
    state: Arc<SharedState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SpiStack {
    /// Start the transport on the given bus.
    ///
    /// Spawns the engine thread, which first enumerates the slaves and
    /// then enters the polling loop. Returns the stack handle (register
    /// it with the router) and the receive side of the event bridge
    /// (hand it to [`crate::bridge::spawn_dispatch_task`]).
    ///
    /// Initialization failures (invalid config, thread spawn) leave
    /// nothing behind; earlier phases unwind by drop.
    pub fn spawn(
        config: SpiStackConfig,
        bus: Box<dyn SpiBus>,
    ) -> Result<(Arc<Self>, BridgeReceiver)> {
        config.validate()?;

        let state = Arc::new(SharedState {
            inner: Mutex::new(StackState {
                queue: VecDeque::new(),
                table: SlaveTable::new(),
                enumerated: false,
            }),
            running: AtomicBool::new(true),
        });

        let (sender, receiver) = event_bridge();
        let engine = SpiEngine::new(config, bus, state.clone(), sender);

        let thread = thread::Builder::new()
            .name("brickwire-spi".to_string())
            .spawn(move || engine.run())?;

        let stack = Arc::new(Self {
            name: SPI_STACK_NAME.to_string(),
            state,
            thread: Mutex::new(Some(thread)),
        });

        Ok((stack, receiver))
    }

    /// Start the transport on the real hardware described by the config.
    #[cfg(target_os = "linux")]
    pub fn open(config: SpiStackConfig) -> Result<(Arc<Self>, BridgeReceiver)> {
        let bus = crate::spi::bus::SpidevBus::open(&config)?;
        Self::spawn(config, Box::new(bus))
    }

    /// Number of slaves found by enumeration, or `None` while discovery
    /// is still in progress.
    pub fn slave_count(&self) -> Option<usize> {
        let state = lock_state(&self.state.inner);
        state.enumerated.then(|| state.table.slave_num())
    }

    /// Total number of device UIDs across all present slaves.
    pub fn uid_count(&self) -> usize {
        lock_state(&self.state.inner).table.uid_count()
    }

    /// Outbound requests waiting for a bus slot.
    pub fn queued_request_count(&self) -> usize {
        lock_state(&self.state.inner).queue.len()
    }

    /// Check if the engine thread was asked to keep running. The thread
    /// also ends on its own when enumeration finds no slaves.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Stop the engine thread and wait for it to finish.
    ///
    /// The running flag is observed at the top of the next tick.
    /// Outstanding queued requests are dropped silently. Keep the
    /// dispatch task (or at least the bridge receiver) alive until this
    /// returns so a hand-off in progress can complete. The SPI device is
    /// closed by the engine thread after its loop returns, so no thread
    /// ever observes a closed bus.
    pub fn shutdown(&self) {
        self.state.running.store(false, Ordering::SeqCst);

        let handle = {
            let mut thread = self
                .thread
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            thread.take()
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("SPI stack thread panicked during shutdown");
            }
        }
    }
}

impl Stack for SpiStack {
    fn name(&self) -> &str {
        &self.name
    }

    fn owns_uid(&self, uid: u32) -> bool {
        lock_state(&self.state.inner).table.knows_uid(uid)
    }

    fn dispatch_request(&self, packet: &Packet) {
        let mut state = lock_state(&self.state.inner);

        if packet.header.is_broadcast() {
            let slave_num = state.table.slave_num();
            for slave_index in 0..slave_num {
                state.queue.push_back(QueuedRequest {
                    slave_index,
                    packet: packet.clone(),
                });
                debug!(
                    "Request {} queued for broadcast to slave {}",
                    packet, slave_index
                );
            }
            return;
        }

        let slave_index = state
            .table
            .find_by_uid(packet.uid())
            .map(|slave| slave.stack_address() as usize);

        match slave_index {
            Some(slave_index) => {
                state.queue.push_back(QueuedRequest {
                    slave_index,
                    packet: packet.clone(),
                });
                debug!(
                    "Request {} queued to be sent to slave {} over SPI",
                    packet, slave_index
                );
            }
            None => {
                error!("No SPI slave owns the UID, dropping request {}", packet);
            }
        }
    }
}

impl Drop for SpiStack {
    fn drop(&mut self) {
        self.shutdown();
    }
}
