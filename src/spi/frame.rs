//! SPI frame encoding and decoding.
//!
//! Every bus transaction exchanges exactly one fixed-size frame in each
//! direction:
//! ```text
//! ┌──────────┬────────┬───────────────┬──────┬──────┐
//! │ Preamble │ Length │ Packet        │ Info │ Hash │
//! │ 0xAA     │ 1 byte │ 0 or 8-80 B   │ 1 B  │ 1 B  │
//! └──────────┴────────┴───────────────┴──────┴──────┘
//! ```
//!
//! `Length` counts every byte of the frame including preamble, info and
//! hash; the minimum of 4 is the empty frame used as a keep-alive poll.
//! Bit 0 of `Info` is the slave's busy flag; the master always sends 0.
//! `Hash` is the Pearson fold over all preceding bytes.
//!
//! Validation order matters on receive: an all-zero read (slave
//! electrically absent or not driving MISO) must stay distinguishable
//! from a corrupted frame, so the preamble is checked before length and
//! hash.

use bytes::Bytes;
use thiserror::Error;

use crate::packet::{Packet, PacketHeader, HEADER_SIZE};
use crate::spi::hash::pearson_hash;

/// Size of one SPI frame; every transaction transfers exactly this many
/// bytes in both directions.
pub const FRAME_SIZE: usize = 84;

/// Size of the empty frame (preamble, length, info, hash).
pub const FRAME_EMPTY_SIZE: usize = 4;

/// Framing overhead around a carried packet.
pub const FRAME_OVERHEAD: usize = 4;

/// Preamble byte opening every frame.
pub const PREAMBLE: u8 = 0xAA;

/// Busy flag in the info byte, set by the slave.
pub const INFO_BUSY: u8 = 1 << 0;

/// Why a frame could not be encoded.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The packet does not fit into a frame.
    #[error("Packet length {0} exceeds frame capacity")]
    Oversize(u8),
}

/// Why a received frame was rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Nonzero preamble byte that is not [`PREAMBLE`].
    #[error("Bad preamble byte {0:#04x}")]
    BadPreamble(u8),

    /// Length outside `[HEADER_SIZE + 4, FRAME_SIZE]` and not the empty
    /// frame size.
    #[error("Malformed frame length {0}")]
    BadLength(u8),

    /// Trailing hash does not match the frame content.
    #[error("Checksum mismatch (actual: {actual:#04x} != expected: {expected:#04x})")]
    ChecksumMismatch {
        /// Hash computed over the received bytes.
        actual: u8,
        /// Hash byte carried by the frame.
        expected: u8,
    },

    /// The embedded packet header disagrees with the frame length.
    #[error("Embedded packet length {packet} does not match frame length {frame}")]
    LengthMismatch {
        /// Length field of the embedded packet header.
        packet: u8,
        /// Length field of the frame.
        frame: u8,
    },
}

/// Outcome of decoding one received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRead {
    /// MISO stayed quiet: the slave is electrically absent or was not
    /// driving the line. No info byte was exchanged.
    Quiet,

    /// A valid empty frame; the slave had nothing to send.
    Empty {
        /// Busy flag from the slave's info byte.
        busy: bool,
    },

    /// A frame carrying a packet.
    Packet {
        /// The contained packet.
        packet: Packet,
        /// Busy flag from the slave's info byte.
        busy: bool,
    },
}

impl FrameRead {
    /// Busy flag of the frame, if one was exchanged.
    pub fn busy(&self) -> Option<bool> {
        match self {
            FrameRead::Quiet => None,
            FrameRead::Empty { busy } | FrameRead::Packet { busy, .. } => Some(*busy),
        }
    }
}

/// Build the empty keep-alive frame used for polling.
pub fn empty_frame() -> [u8; FRAME_SIZE] {
    let mut tx = [0u8; FRAME_SIZE];
    tx[0] = PREAMBLE;
    tx[1] = FRAME_EMPTY_SIZE as u8;
    tx[2] = 0;
    tx[3] = pearson_hash(&tx[..3]);
    tx
}

/// Encode one outbound frame.
///
/// With no packet, or with the peer known busy, the empty keep-alive
/// frame goes out so the slave still gets a chance to reply. The master
/// never asserts the busy flag.
pub fn encode_frame(
    packet: Option<&Packet>,
    peer_busy: bool,
) -> Result<[u8; FRAME_SIZE], EncodeError> {
    let packet = match packet {
        Some(packet) if !peer_busy => packet,
        _ => return Ok(empty_frame()),
    };

    let length = packet.len() + FRAME_OVERHEAD;
    if length > FRAME_SIZE {
        return Err(EncodeError::Oversize(packet.header.length));
    }

    let mut tx = [0u8; FRAME_SIZE];
    tx[0] = PREAMBLE;
    tx[1] = length as u8;
    packet.write_into(&mut tx[2..2 + packet.len()]);
    tx[length - 2] = 0;
    tx[length - 1] = pearson_hash(&tx[..length - 1]);

    Ok(tx)
}

/// Decode one received frame.
///
/// Validates, in order: preamble (a zero byte is a quiet slave, any other
/// non-preamble value is an error), length, hash, and finally the
/// embedded packet header against the frame length.
pub fn decode_frame(rx: &[u8; FRAME_SIZE]) -> Result<FrameRead, DecodeError> {
    match rx[0] {
        0 => return Ok(FrameRead::Quiet),
        PREAMBLE => {}
        other => return Err(DecodeError::BadPreamble(other)),
    }

    let length = rx[1] as usize;
    let valid_packet_len = HEADER_SIZE + FRAME_OVERHEAD..=FRAME_SIZE;
    if length != FRAME_EMPTY_SIZE && !valid_packet_len.contains(&length) {
        return Err(DecodeError::BadLength(rx[1]));
    }

    let actual = pearson_hash(&rx[..length - 1]);
    let expected = rx[length - 1];
    if actual != expected {
        return Err(DecodeError::ChecksumMismatch { actual, expected });
    }

    let busy = rx[length - 2] & INFO_BUSY != 0;

    if length == FRAME_EMPTY_SIZE {
        return Ok(FrameRead::Empty { busy });
    }

    let Some(header) = PacketHeader::decode(&rx[2..2 + HEADER_SIZE]) else {
        return Err(DecodeError::BadLength(rx[1]));
    };
    if header.length as usize != length - FRAME_OVERHEAD {
        return Err(DecodeError::LengthMismatch {
            packet: header.length,
            frame: rx[1],
        });
    }

    let payload = Bytes::copy_from_slice(&rx[2 + HEADER_SIZE..length - 2]);

    Ok(FrameRead::Packet {
        packet: Packet::new(header, payload),
        busy,
    })
}
