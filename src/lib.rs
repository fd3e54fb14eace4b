//! # brickwire
//!
//! Host-side bridge between a fleet of embedded "brick" control modules
//! and network clients. Clients speak a compact binary request/response
//! protocol; brickwire routes each packet to the transport where the
//! addressed device lives and routes responses and asynchronous
//! callbacks back.
//!
//! This crate provides the multi-transport [`Router`] and the complete
//! SPI stack transport. Other transports (USB, RS485) implement the same
//! [`Stack`] interface and share the router.
//!
//! ## Architecture
//!
//! ```text
//! clients ──► Router ──► SpiStack::dispatch_request ──► outbound queue
//!                │                                          │ (mutex)
//!                │                                          ▼
//!                │                                     SPI engine thread
//!                │                                     500 us poll loop
//!                ▼                                          │
//!         ResponseSink ◄── dispatch task ◄── event bridge ◄─┘
//! ```
//!
//! The SPI engine runs on its own OS thread: it enumerates the slaves at
//! startup, then interleaves opportunistic sends with round-robin polls
//! against the bus. Received packets cross back into the event loop
//! through a capacity-one bridge that stalls the engine rather than drop
//! a payload.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use brickwire::{Router, SpiStack};
//! use brickwire::bridge::spawn_dispatch_task;
//! use brickwire::config::SpiStackConfig;
//!
//! let router = Arc::new(Router::new(network_sink));
//! let (stack, receiver) = SpiStack::open(SpiStackConfig::default())?;
//! router.add_stack(stack.clone());
//! spawn_dispatch_task(receiver, router.clone());
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod packet;
pub mod router;
pub mod spi;
pub mod util;

pub use bridge::{event_bridge, spawn_dispatch_task, BridgeReceiver, BridgeSender};
pub use error::{BrickwireError, Result};
pub use packet::{Packet, PacketHeader};
pub use router::{ResponseSink, Router, Stack};
pub use spi::SpiStack;
