//! SPI stack configuration.
//!
//! Defaults carry the wire-contract values: `/dev/spidev0.0` at 8 MHz,
//! CPOL mode, MSB first, 8 bits per word, a 500 us polling cadence and a
//! 10 x 50 ms enumeration retry budget. A deployment normally only
//! overrides the device paths and select lines.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BrickwireError, Result};
use crate::spi::slave::MAX_SLAVES;

/// Default SPI character device.
pub const DEFAULT_SPI_DEVICE: &str = "/dev/spidev0.0";

/// Default GPIO character device carrying the slave select lines.
pub const DEFAULT_GPIO_CHIP: &str = "/dev/gpiochip0";

/// Default SPI clock (8 MHz).
pub const DEFAULT_MAX_SPEED_HZ: u32 = 8_000_000;

/// Default polling cadence of the SPI loop in microseconds.
pub const DEFAULT_POLL_INTERVAL_US: u64 = 500;

/// Default number of attempts per enumeration phase.
pub const DEFAULT_ENUMERATE_TRIES: u32 = 10;

/// Default pause between enumeration attempts in milliseconds.
pub const DEFAULT_ENUMERATE_WAIT_MS: u64 = 50;

// Port C pins 8-15 of the bridge SoC, one select line per stack address.
const DEFAULT_SELECT_LINES: [u32; MAX_SLAVES] = [72, 73, 74, 75, 76, 77, 78, 79];

/// Configuration for one SPI stack transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpiStackConfig {
    /// SPI character device path.
    pub device: String,

    /// Maximum SPI clock in Hz.
    pub max_speed_hz: u32,

    /// GPIO character device carrying the select lines.
    pub gpio_chip: String,

    /// GPIO line offsets of the slave select lines, one per stack
    /// address in address order. Lines are driven high (deselected)
    /// between transactions.
    pub select_lines: Vec<u32>,

    /// Polling cadence of the SPI loop in microseconds.
    pub poll_interval_us: u64,

    /// Attempts per enumeration phase before a slave is declared absent.
    pub enumerate_tries: u32,

    /// Pause between enumeration attempts in milliseconds.
    pub enumerate_wait_ms: u64,

    /// Position of the bridge itself on the bus. Only master mode
    /// (address 0) is supported.
    pub stack_address: u8,

    /// UID of the bridge master, patched into enumerate responses as the
    /// connected UID when present.
    pub master_uid: Option<u32>,
}

impl Default for SpiStackConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_SPI_DEVICE.to_string(),
            max_speed_hz: DEFAULT_MAX_SPEED_HZ,
            gpio_chip: DEFAULT_GPIO_CHIP.to_string(),
            select_lines: DEFAULT_SELECT_LINES.to_vec(),
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
            enumerate_tries: DEFAULT_ENUMERATE_TRIES,
            enumerate_wait_ms: DEFAULT_ENUMERATE_WAIT_MS,
            stack_address: 0,
            master_uid: None,
        }
    }
}

impl SpiStackConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.stack_address != 0 {
            return Err(BrickwireError::Config(
                "only master mode supported".to_string(),
            ));
        }

        if self.select_lines.len() != MAX_SLAVES {
            return Err(BrickwireError::Config(format!(
                "expected {} select lines, got {}",
                MAX_SLAVES,
                self.select_lines.len()
            )));
        }

        if self.poll_interval_us == 0 {
            return Err(BrickwireError::Config(
                "poll interval must be nonzero".to_string(),
            ));
        }

        if self.enumerate_tries == 0 {
            return Err(BrickwireError::Config(
                "enumeration needs at least one attempt".to_string(),
            ));
        }

        Ok(())
    }

    /// Polling cadence as a [`Duration`].
    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    /// Enumeration attempt pause as a [`Duration`].
    #[inline]
    pub fn enumerate_wait(&self) -> Duration {
        Duration::from_millis(self.enumerate_wait_ms)
    }
}
