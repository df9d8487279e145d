use bytes::Buf;

use crate::error::{Error, Result};

/// Packet flags
pub const FLAG_SYNCHRONIZE: u16 = 0x0001;
pub const FLAG_CLOSE: u16 = 0x0002;
pub const FLAG_RESET: u16 = 0x0004;
pub const FLAG_SIGNATURE_INCLUDED: u16 = 0x0008;
pub const FLAG_SIGNATURE_REQUESTED: u16 = 0x0010;
pub const FLAG_FROM_INCLUDED: u16 = 0x0020;
pub const FLAG_DELAY_REQUESTED: u16 = 0x0040;
pub const FLAG_MAX_PACKET_SIZE_INCLUDED: u16 = 0x0080;
pub const FLAG_PROFILE_INTERACTIVE: u16 = 0x0100;
pub const FLAG_ECHO: u16 = 0x0200;
pub const FLAG_NO_ACK: u16 = 0x0400;

/// Hard ceiling on a decoded packet (bytes)
pub const MAX_PACKET_SIZE: usize = 4096;

/// Maximum payload advertised to peers in the SYN options
pub const STREAMING_MTU: u16 = 1730;

/// Header size with zero NACK entries (up to and including options_size)
pub const MIN_HEADER_SIZE: usize = 22;

/// A streaming packet
///
/// Wire format, all integers big-endian:
/// ```text
/// [send_stream_id: u32][recv_stream_id: u32][seqn: u32][ack_through: u32]
/// [nack_count: u8][NACKs: 4 * nack_count][resend_delay: u8]
/// [flags: u16][options_size: u16][options][payload]
/// ```
///
/// Options appear in the canonical order FROM (387 bytes) →
/// MAX_PACKET_SIZE (2 bytes) → SIGNATURE (40 bytes), gated by the
/// corresponding flags.
///
/// The buffer is validated once by [`Packet::parse`]; accessors after that
/// are infallible and never mutate it. `offset` tracks how many payload
/// bytes the application has already consumed.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Vec<u8>,
    offset: usize,
}

impl Packet {
    /// Validate and take ownership of a raw packet buffer.
    ///
    /// Checks that the fixed header, the NACK block and the options block
    /// all fit inside the buffer, so the accessors below cannot go out of
    /// bounds. NACK entries are accepted (and skipped) but never consumed.
    pub fn parse(buf: Vec<u8>) -> Result<Self> {
        if buf.len() < MIN_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "packet too short: {} bytes (expected at least {})",
                buf.len(),
                MIN_HEADER_SIZE
            )));
        }

        let nacks = buf[16] as usize;
        let header = MIN_HEADER_SIZE + nacks * 4;
        if buf.len() < header {
            return Err(Error::Protocol(format!(
                "packet too short for {} NACK entries: {} bytes",
                nacks,
                buf.len()
            )));
        }

        let options_size = u16::from_be_bytes([buf[header - 2], buf[header - 1]]) as usize;
        if buf.len() < header + options_size {
            return Err(Error::Protocol(format!(
                "options overflow packet: {} + {} > {}",
                header,
                options_size,
                buf.len()
            )));
        }

        Ok(Self { buf, offset: 0 })
    }

    /// Recipient's stream id (0 on the first packet of a new stream)
    pub fn send_stream_id(&self) -> u32 {
        (&self.buf[0..]).get_u32()
    }

    /// Sender's stream id; the recipient echoes it back as send_stream_id
    pub fn recv_stream_id(&self) -> u32 {
        (&self.buf[4..]).get_u32()
    }

    /// Sequence number; 0 means a pure ACK unless SYNCHRONIZE is set
    pub fn seqn(&self) -> u32 {
        (&self.buf[8..]).get_u32()
    }

    /// Highest contiguously received sequence number observed by the sender
    pub fn ack_through(&self) -> u32 {
        (&self.buf[12..]).get_u32()
    }

    pub fn nack_count(&self) -> u8 {
        self.buf[16]
    }

    pub fn resend_delay(&self) -> u8 {
        self.buf[17 + self.nack_count() as usize * 4]
    }

    pub fn flags(&self) -> u16 {
        let at = 18 + self.nack_count() as usize * 4;
        (&self.buf[at..]).get_u16()
    }

    pub fn options_size(&self) -> usize {
        let at = 20 + self.nack_count() as usize * 4;
        (&self.buf[at..]).get_u16() as usize
    }

    /// The options block, already bounds-checked by `parse`
    pub fn option_data(&self) -> &[u8] {
        let start = MIN_HEADER_SIZE + self.nack_count() as usize * 4;
        &self.buf[start..start + self.options_size()]
    }

    fn payload_start(&self) -> usize {
        MIN_HEADER_SIZE + self.nack_count() as usize * 4 + self.options_size()
    }

    /// Application payload (everything past the options)
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_start()..]
    }

    /// Move the consumption cursor to the first payload byte
    pub fn seek_to_payload(&mut self) {
        self.offset = self.payload_start();
    }

    /// Unconsumed bytes at the cursor
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    /// Consume `n` bytes at the cursor
    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.buf.len());
    }

    /// Total packet length in bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The full raw buffer
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_syn(&self) -> bool {
        self.flags() & FLAG_SYNCHRONIZE != 0
    }

    pub fn is_close(&self) -> bool {
        self.flags() & FLAG_CLOSE != 0
    }

    pub fn is_reset(&self) -> bool {
        self.flags() & FLAG_RESET != 0
    }

    pub fn is_no_ack(&self) -> bool {
        self.flags() & FLAG_NO_ACK != 0
    }
}
