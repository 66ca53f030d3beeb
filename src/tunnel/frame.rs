//! Segment framing
//!
//! Segment format:
//! ```text
//! +--------+--------+--------+---------------------+
//! | Channel|    Length (2B)  |  Payload (Length B) |
//! +--------+--------+--------+---------------------+
//! ```
//!
//! Segments are written back to back with no delimiter. A payload larger
//! than [`MAX_SEGMENT_SIZE`] is split into several segments for the same
//! channel.

use super::TunnelError;
use crate::channel::ChannelId;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Segment header size in bytes
pub const HEADER_SIZE: usize = 3;

/// Maximum payload carried by one segment
pub const MAX_SEGMENT_SIZE: usize = u16::MAX as usize;

/// Header preceding every segment on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Addressed channel
    pub channel: ChannelId,
    /// Payload length in bytes
    pub length: u16,
}

impl SegmentHeader {
    /// Header for a payload of `length` bytes
    pub fn new(channel: ChannelId, length: usize) -> Result<Self, TunnelError> {
        let length = u16::try_from(length).map_err(|_| TunnelError::SegmentTooLarge(length))?;
        Ok(Self { channel, length })
    }

    pub fn decode(raw: [u8; HEADER_SIZE]) -> Self {
        Self {
            channel: raw[0],
            length: u16::from_be_bytes([raw[1], raw[2]]),
        }
    }

    /// Append the encoded header to `buf`
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.channel);
        buf.put_u16(self.length);
    }
}

/// Append `payload` to `buf` as one or more segments for `channel`.
pub fn encode_segments(channel: ChannelId, payload: &[u8], buf: &mut BytesMut) {
    for chunk in payload.chunks(MAX_SEGMENT_SIZE) {
        let header = SegmentHeader {
            channel,
            length: chunk.len() as u16,
        };
        buf.reserve(HEADER_SIZE + chunk.len());
        header.put(buf);
        buf.extend_from_slice(chunk);
    }
}

/// Take one complete segment off the front of `buf`, if buffered.
pub fn decode_segment(buf: &mut BytesMut) -> Option<(SegmentHeader, Bytes)> {
    if buf.len() < HEADER_SIZE {
        return None;
    }

    let header = SegmentHeader::decode([buf[0], buf[1], buf[2]]);
    if buf.len() < HEADER_SIZE + header.length as usize {
        return None;
    }

    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(header.length as usize).freeze();
    Some((header, payload))
}
