//! SPI bus access.
//!
//! The engine talks to the bus through the [`SpiBus`] trait so the
//! polling loop and enumeration can run against a scripted bus in tests.
//! The production implementation drives a `/dev/spidevX.Y` device plus
//! one GPIO select line per stack address.

use std::io;

use crate::spi::frame::FRAME_SIZE;

/// Full-duplex frame transport to one SPI bus.
///
/// A transfer clocks exactly [`FRAME_SIZE`] bytes in both directions
/// with the addressed slave selected, and leaves every slave deselected
/// afterwards.
pub trait SpiBus: Send {
    /// Exchange one frame with the slave at `stack_address`.
    fn transfer(
        &mut self,
        stack_address: u8,
        tx: &[u8; FRAME_SIZE],
        rx: &mut [u8; FRAME_SIZE],
    ) -> io::Result<()>;
}

// ============================================================================
// Linux implementation (spidev + GPIO character device)
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;

    use gpio_cdev::{Chip, LineHandle, LineRequestFlags};
    use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

    use crate::config::SpiStackConfig;
    use crate::error::Result;

    const LINE_CONSUMER: &str = "brickwire-spi";

    /// Bus backed by a spidev device and per-slave select lines.
    ///
    /// The device is configured once at open: CPOL mode, MSB first,
    /// 8 bits per word, clock from the config. Select lines are driven
    /// high (deselected) at open and between transactions; a transfer
    /// pulls the addressed line low around a single duplex ioctl.
    pub struct SpidevBus {
        spi: Spidev,
        select_lines: Vec<LineHandle>,
    }

    impl SpidevBus {
        /// Open and configure the SPI device and select lines.
        ///
        /// Any configuration failure here is fatal to transport init.
        pub fn open(config: &SpiStackConfig) -> Result<Self> {
            let mut spi = Spidev::open(&config.device)?;
            let options = SpidevOptions::new()
                .bits_per_word(8)
                .max_speed_hz(config.max_speed_hz)
                .lsb_first(false)
                .mode(SpiModeFlags::SPI_CPOL)
                .build();
            spi.configure(&options)?;

            let mut chip = Chip::new(&config.gpio_chip).map_err(gpio_error)?;
            let mut select_lines = Vec::with_capacity(config.select_lines.len());
            for &offset in &config.select_lines {
                let line = chip.get_line(offset).map_err(gpio_error)?;
                let handle = line
                    .request(LineRequestFlags::OUTPUT, 1, LINE_CONSUMER)
                    .map_err(gpio_error)?;
                select_lines.push(handle);
            }

            Ok(Self { spi, select_lines })
        }
    }

    impl SpiBus for SpidevBus {
        fn transfer(
            &mut self,
            stack_address: u8,
            tx: &[u8; FRAME_SIZE],
            rx: &mut [u8; FRAME_SIZE],
        ) -> io::Result<()> {
            let line = self.select_lines.get(stack_address as usize).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no select line for stack address {}", stack_address),
                )
            })?;

            line.set_value(0).map_err(line_error)?;
            let transferred = {
                let mut transfer = SpidevTransfer::read_write(tx, rx);
                self.spi.transfer(&mut transfer)
            };
            let deselected = line.set_value(1).map_err(line_error);

            transferred?;
            deselected
        }
    }

    fn gpio_error(error: gpio_cdev::Error) -> crate::error::BrickwireError {
        crate::error::BrickwireError::Io(line_error(error))
    }

    fn line_error(error: gpio_cdev::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, error)
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::SpidevBus;
