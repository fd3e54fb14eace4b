//! Packet types for protocol version 2.
//!
//! Implements the 8-byte header format shared by every transport:
//! ```text
//! ┌──────────┬────────┬──────────┬───────────┬────────┐
//! │ UID      │ Length │ Function │ Seq+Opts  │ Error  │
//! │ 4 bytes  │ 1 byte │ 1 byte   │ 1 byte    │ 1 byte │
//! │ u32 LE   │ total  │          │           │        │
//! └──────────┴────────┴──────────┴───────────┴────────┘
//! ```
//!
//! `Length` counts the whole packet including the header, so a valid
//! packet is 8 to 80 bytes long. All multi-byte integers are Little
//! Endian. UID 0 is reserved as the broadcast address.

use std::fmt;

use bytes::Bytes;

use crate::error::{BrickwireError, Result};
use crate::util::base58_encode;

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Maximum total packet size (header + payload).
pub const PACKET_MAX_SIZE: usize = 80;

/// Maximum payload size.
pub const PAYLOAD_MAX_SIZE: usize = PACKET_MAX_SIZE - HEADER_SIZE;

/// Reserved UID addressing every device on every transport.
pub const BROADCAST_UID: u32 = 0;

/// Function ID of the stack enumerate request sent during discovery.
pub const FUNCTION_STACK_ENUMERATE: u8 = 252;

/// Function ID of the spontaneous enumerate callback.
pub const CALLBACK_ENUMERATE: u8 = 253;

/// Function ID of the get-identity request/response pair.
pub const FUNCTION_GET_IDENTITY: u8 = 255;

/// Maximum number of UIDs in one stack enumerate response.
pub const MAX_STACK_ENUMERATE_UIDS: usize = 16;

/// Option bit constants for the sequence/options header byte.
pub mod options {
    /// Response-expected flag (bit 3).
    pub const RESPONSE_EXPECTED: u8 = 0b0000_1000;

    /// Sequence number mask (bits 4-7).
    pub const SEQUENCE_MASK: u8 = 0b1111_0000;

    /// Shift to move a sequence number into its field.
    pub const SEQUENCE_SHIFT: u8 = 4;
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Device UID (0 = broadcast). Little Endian on the wire.
    pub uid: u32,
    /// Total packet length in bytes, header included (8-80).
    pub length: u8,
    /// Function identifier.
    pub function_id: u8,
    /// Sequence number (bits 4-7) and option flags (bits 0-3).
    pub sequence_number_and_options: u8,
    /// Error code (bits 0-1); remaining bits reserved.
    pub error_code_and_future_use: u8,
}

impl PacketHeader {
    /// Create a new header.
    pub fn new(
        uid: u32,
        length: u8,
        function_id: u8,
        sequence_number_and_options: u8,
        error_code_and_future_use: u8,
    ) -> Self {
        Self {
            uid,
            length,
            function_id,
            sequence_number_and_options,
            error_code_and_future_use,
        }
    }

    /// Encode header to bytes (Little Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.uid.to_le_bytes());
        buf[4] = self.length;
        buf[5] = self.function_id;
        buf[6] = self.sequence_number_and_options;
        buf[7] = self.error_code_and_future_use;
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            uid: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: buf[4],
            function_id: buf[5],
            sequence_number_and_options: buf[6],
            error_code_and_future_use: buf[7],
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// The length field must cover at least the header and at most the
    /// maximum packet size.
    pub fn validate(&self) -> Result<()> {
        if (self.length as usize) < HEADER_SIZE {
            return Err(BrickwireError::Protocol(format!(
                "Packet length {} below header size {}",
                self.length, HEADER_SIZE
            )));
        }

        if self.length as usize > PACKET_MAX_SIZE {
            return Err(BrickwireError::Protocol(format!(
                "Packet length {} exceeds maximum {}",
                self.length, PACKET_MAX_SIZE
            )));
        }

        Ok(())
    }

    /// Get the sequence number (0-15).
    #[inline]
    pub fn sequence_number(&self) -> u8 {
        (self.sequence_number_and_options & options::SEQUENCE_MASK) >> options::SEQUENCE_SHIFT
    }

    /// Check if the sender expects a response.
    #[inline]
    pub fn response_expected(&self) -> bool {
        self.sequence_number_and_options & options::RESPONSE_EXPECTED != 0
    }

    /// Get the error code (0 = ok).
    #[inline]
    pub fn error_code(&self) -> u8 {
        self.error_code_and_future_use & 0b0000_0011
    }

    /// Check if this packet addresses every device.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.uid == BROADCAST_UID
    }

    /// Check if this is a callback (sequence number 0).
    #[inline]
    pub fn is_callback(&self) -> bool {
        self.sequence_number() == 0
    }
}

/// A complete packet: header plus payload.
///
/// Packets are value types. The payload uses `bytes::Bytes`, so cloning a
/// packet on hand-off copies the declared length once and is cheap
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Decoded header.
    pub header: PacketHeader,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet from a header and matching payload.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the header length does not match the
    /// payload length.
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        debug_assert_eq!(header.length as usize, HEADER_SIZE + payload.len());
        Self { header, payload }
    }

    /// Build a request packet, computing the length field.
    ///
    /// Fails with [`BrickwireError::PacketTooLarge`] when the payload
    /// exceeds [`PAYLOAD_MAX_SIZE`].
    pub fn request(
        uid: u32,
        function_id: u8,
        sequence_number: u8,
        response_expected: bool,
        payload: Bytes,
    ) -> Result<Self> {
        if payload.len() > PAYLOAD_MAX_SIZE {
            return Err(BrickwireError::PacketTooLarge(HEADER_SIZE + payload.len()));
        }

        let mut seq_and_opts = (sequence_number << options::SEQUENCE_SHIFT) & options::SEQUENCE_MASK;
        if response_expected {
            seq_and_opts |= options::RESPONSE_EXPECTED;
        }

        let header = PacketHeader::new(
            uid,
            (HEADER_SIZE + payload.len()) as u8,
            function_id,
            seq_and_opts,
            0,
        );

        Ok(Self { header, payload })
    }

    /// Build the stack enumerate request used during slave discovery:
    /// broadcast UID, empty payload, response expected.
    pub fn stack_enumerate_request() -> Self {
        let header = PacketHeader::new(
            BROADCAST_UID,
            HEADER_SIZE as u8,
            FUNCTION_STACK_ENUMERATE,
            options::RESPONSE_EXPECTED,
            0,
        );

        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Decode a packet from wire bytes, copying the payload by the
    /// declared length.
    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        let header = PacketHeader::decode(buf)
            .ok_or_else(|| BrickwireError::Protocol("Packet shorter than header".to_string()))?;
        header.validate()?;

        let total = header.length as usize;
        if buf.len() < total {
            return Err(BrickwireError::Protocol(format!(
                "Packet truncated (have: {} < declared: {})",
                buf.len(),
                total
            )));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..total]),
        })
    }

    /// Encode the packet into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than [`Packet::len`].
    pub fn write_into(&self, buf: &mut [u8]) {
        self.header.encode_into(buf);
        buf[HEADER_SIZE..self.len()].copy_from_slice(&self.payload);
    }

    /// Encode the packet as a contiguous byte vector.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.len()];
        self.write_into(&mut buf);
        buf
    }

    /// Total packet length in bytes (header + payload).
    #[inline]
    pub fn len(&self) -> usize {
        self.header.length as usize
    }

    /// A packet is never empty; the header is always present.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the device UID.
    #[inline]
    pub fn uid(&self) -> u32 {
        self.header.uid
    }

    /// Parse the UID list of a stack enumerate response.
    ///
    /// The list is terminated by a zero UID or by the capacity of the
    /// response ([`MAX_STACK_ENUMERATE_UIDS`]).
    pub fn enumerate_uids(&self) -> Vec<u32> {
        let mut uids = Vec::new();

        for chunk in self.payload.chunks_exact(4).take(MAX_STACK_ENUMERATE_UIDS) {
            let uid = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if uid == 0 {
                break;
            }
            uids.push(uid);
        }

        uids
    }

    /// Patch the stack position into an enumerate or get-identity
    /// response coming straight off a transport.
    ///
    /// Devices report position `'0'` when they do not know where in the
    /// stack they sit; the transport fills in its 1-based stack address
    /// and, when known, the bridge master's UID as the connected UID.
    /// Returns `true` if the packet was rewritten.
    pub fn patch_enumerate_position(&mut self, stack_address: u8, master_uid: Option<u32>) -> bool {
        const UID_FIELD: usize = 8;
        const POSITION: usize = 16;

        if self.header.function_id != CALLBACK_ENUMERATE
            && self.header.function_id != FUNCTION_GET_IDENTITY
        {
            return false;
        }

        if self.payload.len() <= POSITION || self.payload[POSITION] != b'0' {
            return false;
        }

        let mut payload = self.payload.to_vec();
        payload[POSITION] = b'0' + stack_address + 1;

        if let Some(uid) = master_uid {
            let connected = &mut payload[UID_FIELD..UID_FIELD + 8];
            connected.fill(0);
            let encoded = base58_encode(uid);
            connected[..encoded.len()].copy_from_slice(encoded.as_bytes());
        }

        self.payload = Bytes::from(payload);
        true
    }
}

impl fmt::Display for Packet {
    /// Render the log signature `(U: <base58>, L: .., F: .., S: .., R: .., E: ..)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(U: {}, L: {}, F: {}, S: {}, R: {}, E: {})",
            base58_encode(self.header.uid),
            self.header.length,
            self.header.function_id,
            self.header.sequence_number(),
            self.header.response_expected() as u8,
            self.header.error_code(),
        )
    }
}
