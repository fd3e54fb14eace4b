//! Event bridge between the SPI thread and the event loop.
//!
//! Received frames are decoded on the SPI thread but must be dispatched
//! from the event loop. The bridge is a bounded channel of capacity one:
//!
//! ```text
//! SPI thread ─► BridgeSender::send_blocking ─► [1 slot] ─► dispatch task ─► Router
//! ```
//!
//! The single slot gives hard back-pressure: the SPI thread blocks on
//! its next hand-off until the event loop has taken the previous packet.
//! Received frames arrive far slower than the polling cadence, and a
//! stalled SPI thread is preferable to dropping a payload, so the bound
//! is deliberately not configurable. Delivery order is the decode order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{BrickwireError, Result};
use crate::packet::Packet;
use crate::router::Router;

/// Packets in flight across the bridge.
pub const BRIDGE_CAPACITY: usize = 1;

/// Create a connected bridge pair.
pub fn event_bridge() -> (BridgeSender, BridgeReceiver) {
    let (tx, rx) = mpsc::channel(BRIDGE_CAPACITY);
    (BridgeSender { tx }, BridgeReceiver { rx })
}

/// SPI-thread side of the bridge.
#[derive(Clone)]
pub struct BridgeSender {
    tx: mpsc::Sender<Packet>,
}

impl BridgeSender {
    /// Hand one received packet to the event loop.
    ///
    /// Blocks the calling thread while the slot is occupied. Must not be
    /// called from async context; the SPI engine calls it from its own
    /// OS thread.
    ///
    /// Fails with [`BrickwireError::BridgeClosed`] when the event-loop
    /// side is gone.
    pub fn send_blocking(&self, packet: Packet) -> Result<()> {
        self.tx
            .blocking_send(packet)
            .map_err(|_| BrickwireError::BridgeClosed)
    }
}

/// Event-loop side of the bridge.
pub struct BridgeReceiver {
    rx: mpsc::Receiver<Packet>,
}

impl BridgeReceiver {
    /// Receive the next packet, freeing the slot for the SPI thread.
    ///
    /// Returns `None` once the SPI side is gone and the slot is drained.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }
}

/// Spawn the task that forwards bridged packets into the router.
///
/// The task ends when the SPI side of the bridge is dropped.
pub fn spawn_dispatch_task(mut receiver: BridgeReceiver, router: Arc<Router>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(packet) = receiver.recv().await {
            debug!("Dispatching response from SPI {}", packet);
            router.dispatch_response(&packet);
        }
        debug!("SPI event bridge drained, dispatch task ends");
    })
}
