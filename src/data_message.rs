//! Framing between stream packets and the substrate's application-data
//! messages: a 4-byte length prefix over a gzip stream whose header bytes
//! are repurposed — bytes 4..8 carry the source/destination ports (reserved
//! as zero here) and byte 9 carries the protocol id.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::warn;

use crate::error::{Error, Result};
use crate::packet::{Packet, MAX_PACKET_SIZE};

/// Protocol id of the streaming layer inside application-data messages
pub const PROTOCOL_STREAMING: u8 = 6;

/// Byte offset of the reserved port fields inside the gzip stream
const PORTS_OFFSET: usize = 4;

/// Byte offset of the protocol id inside the gzip stream
const PROTOCOL_OFFSET: usize = 9;

/// Compress a stream packet into an application-data message.
///
/// The lowest deflate level is used; these packets favor latency over ratio.
pub fn create_data_message(payload: &[u8]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(payload)?;
    let mut compressed = encoder.finish()?;

    // A gzip stream is never shorter than its 10-byte header.
    debug_assert!(compressed.len() > PROTOCOL_OFFSET);
    compressed[PORTS_OFFSET..PORTS_OFFSET + 4].fill(0);
    compressed[PROTOCOL_OFFSET] = PROTOCOL_STREAMING;

    let mut msg = BytesMut::with_capacity(4 + compressed.len());
    msg.put_u32(compressed.len() as u32);
    msg.put_slice(&compressed);
    Ok(msg.freeze())
}

/// Decompress an inbound application-data message into a stream packet.
///
/// Messages carrying any other protocol id are rejected. Decompressed data
/// beyond [`MAX_PACKET_SIZE`] is truncated to the cap.
pub fn parse_data_message(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 4 {
        return Err(Error::Protocol("data message missing length".into()));
    }
    let length = (&buf[..4]).get_u32() as usize;
    let body = &buf[4..];
    if body.len() < length {
        return Err(Error::Protocol(format!(
            "data message truncated: {} of {} bytes",
            body.len(),
            length
        )));
    }
    let body = &body[..length];

    if body.len() <= PROTOCOL_OFFSET {
        return Err(Error::Protocol("data message too short".into()));
    }
    if body[PROTOCOL_OFFSET] != PROTOCOL_STREAMING {
        return Err(Error::UnsupportedProtocol(body[PROTOCOL_OFFSET]));
    }

    let mut decompressed = Vec::new();
    GzDecoder::new(body)
        .take(MAX_PACKET_SIZE as u64 + 1)
        .read_to_end(&mut decompressed)?;
    if decompressed.len() > MAX_PACKET_SIZE {
        warn!(
            "decompressed packet exceeds cap, truncating {} to {}",
            decompressed.len(),
            MAX_PACKET_SIZE
        );
        decompressed.truncate(MAX_PACKET_SIZE);
    }

    Packet::parse(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn raw_packet(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(1); // send stream id
        buf.put_u32(2); // recv stream id
        buf.put_u32(1); // seqn
        buf.put_u32(0); // ack through
        buf.put_u8(0); // NACK count
        buf.put_u8(0); // resend delay
        buf.put_u16(0); // flags
        buf.put_u16(0); // options size
        buf.put_slice(payload);
        buf.to_vec()
    }

    #[test]
    fn test_roundtrip() {
        let raw = raw_packet(b"stream payload bytes");
        let msg = create_data_message(&raw).unwrap();

        let packet = parse_data_message(&msg).unwrap();
        assert_eq!(packet.as_bytes(), &raw[..]);
        assert_eq!(packet.payload(), b"stream payload bytes");
    }

    #[test]
    fn test_protocol_byte_set() {
        let msg = create_data_message(&raw_packet(b"x")).unwrap();
        assert_eq!(msg[4 + PROTOCOL_OFFSET], PROTOCOL_STREAMING);
        // reserved port bytes are zeroed
        assert_eq!(&msg[4 + PORTS_OFFSET..4 + PORTS_OFFSET + 4], &[0u8; 4]);
    }

    #[test]
    fn test_rejects_foreign_protocol() {
        let mut msg = BytesMut::from(&create_data_message(&raw_packet(b"x")).unwrap()[..]);
        msg[4 + PROTOCOL_OFFSET] = 17;
        assert!(matches!(
            parse_data_message(&msg),
            Err(Error::UnsupportedProtocol(17))
        ));
    }

    #[test]
    fn test_rejects_short_input() {
        assert!(parse_data_message(&[0, 0]).is_err());
        assert!(parse_data_message(&[0, 0, 0, 50, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_oversize_truncated_to_cap() {
        // A buffer with a valid header but far more payload than the cap.
        let raw = raw_packet(&vec![0x5A; MAX_PACKET_SIZE * 2]);
        let msg = create_data_message(&raw).unwrap();

        let packet = parse_data_message(&msg).unwrap();
        assert_eq!(packet.len(), MAX_PACKET_SIZE);
    }
}
