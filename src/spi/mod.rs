//! The SPI stack transport.
//!
//! Drives a half-duplex SPI bus carrying up to eight slave modules. The
//! pieces, leaves first:
//!
//! - [`hash`] / [`frame`]: the 84-byte wire frame and its Pearson
//!   integrity check
//! - [`slave`]: the slave table built by enumeration
//! - [`bus`]: the hardware seam ([`bus::SpiBus`]) and its spidev
//!   implementation
//! - [`engine`]: enumeration and the 500 us polling loop (internal)
//! - [`stack`]: the router-facing [`stack::SpiStack`] transport

pub mod bus;
pub mod frame;
pub mod hash;
pub mod slave;
pub mod stack;

pub(crate) mod engine;

pub use bus::SpiBus;
pub use stack::SpiStack;
