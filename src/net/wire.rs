//! Compact binary writer/reader and the frame envelope
//!
//! The data plane does not use bincode: full and delta frames have a
//! fixed-layout custom format (quantized scalars, length-prefixed lists)
//! that stays byte-stable across crate versions. This module holds the
//! primitives; `net::codec` decides what goes in them.

use std::fmt;

/// Hard cap for one encoded frame, matching the transport message limit
pub const MAX_FRAME_SIZE: usize = 65536;

/// Errors from envelope encode/decode
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),
    #[error("Frame truncated at offset {0}")]
    Truncated(usize),
    #[error("Unknown frame kind tag: {0}")]
    InvalidKind(u8),
    #[error("List of {0} entries exceeds the u16 header")]
    ListTooLong(usize),
}

/// What a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Complete filtered object set
    Full,
    /// Changes against the viewer's baseline
    Delta,
    /// Plain-text (JSON) emergency encoding
    Fallback,
}

impl FrameKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            FrameKind::Full => 0,
            FrameKind::Delta => 1,
            FrameKind::Fallback => 2,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FrameKind::Full),
            1 => Some(FrameKind::Delta),
            2 => Some(FrameKind::Fallback),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Full => write!(f, "full"),
            FrameKind::Delta => write!(f, "delta"),
            FrameKind::Fallback => write!(f, "fallback"),
        }
    }
}

/// Envelope handed to the per-viewer send primitive.
///
/// Layout: [u8 kind][u64 tick][u64 timestamp_ms][u32 payload_len][payload]
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub tick: u64,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let total = 1 + 8 + 8 + 4 + self.payload.len();
        if total > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(total, MAX_FRAME_SIZE));
        }
        let mut w = WireWriter::with_capacity(total);
        w.write_u8(self.kind.as_u8());
        w.write_u64(self.tick);
        w.write_u64(self.timestamp_ms);
        w.write_u32(self.payload.len() as u32);
        w.write_bytes(&self.payload);
        Ok(w.into_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Frame, WireError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(data.len(), MAX_FRAME_SIZE));
        }
        let mut r = WireReader::new(data);
        let tag = r.read_u8().ok_or(WireError::Truncated(0))?;
        let kind = FrameKind::from_u8(tag).ok_or(WireError::InvalidKind(tag))?;
        let tick = r.read_u64().ok_or(WireError::Truncated(r.position()))?;
        let timestamp_ms = r.read_u64().ok_or(WireError::Truncated(r.position()))?;
        let len = r.read_u32().ok_or(WireError::Truncated(r.position()))? as usize;
        let payload = r
            .read(len)
            .ok_or(WireError::Truncated(r.position()))?
            .to_vec();
        Ok(Frame {
            kind,
            tick,
            timestamp_ms,
            payload,
        })
    }
}

/// Growing little-endian byte writer
pub struct WireWriter {
    buffer: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i16(&mut self, value: i16) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// u8-length-prefixed UTF-8; over-long strings are truncated on a char
    /// boundary
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        let mut end = value.len().min(u8::MAX as usize);
        while end > 0 && !value.is_char_boundary(end) {
            end -= 1;
        }
        self.buffer.push(end as u8);
        self.buffer.extend_from_slice(&value.as_bytes()[..end]);
        self
    }

    /// u16 element-count prefix for a list that follows. Counts past the
    /// header's range are refused rather than mislabeled.
    pub fn write_list_header(&mut self, count: usize) -> Result<&mut Self, WireError> {
        if count > u16::MAX as usize {
            return Err(WireError::ListTooLong(count));
        }
        Ok(self.write_u16(count as u16))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Position-tracking reader; every read returns None past the end instead of
/// panicking, which is what the permissive decode path relies on
pub struct WireReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn read(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.position + n > self.data.len() {
            return None;
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Some(slice)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read(1).map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.read(8)
            .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_i16(&mut self) -> Option<i16> {
        self.read(2).map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.read(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f32(&mut self) -> Option<f32> {
        self.read(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_str(&mut self) -> Option<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.read(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    pub fn read_list_header(&mut self) -> Option<usize> {
        self.read_u16().map(|c| c as usize)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_roundtrip() {
        let mut w = WireWriter::new();
        w.write_u8(7);
        w.write_u16(1234);
        w.write_u32(567_890);
        w.write_u64(12_345_678_901);
        w.write_i16(-321);
        w.write_i32(-7_654_321);
        w.write_f32(2.5);
        w.write_str("viewer");
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_u8(), Some(7));
        assert_eq!(r.read_u16(), Some(1234));
        assert_eq!(r.read_u32(), Some(567_890));
        assert_eq!(r.read_u64(), Some(12_345_678_901));
        assert_eq!(r.read_i16(), Some(-321));
        assert_eq!(r.read_i32(), Some(-7_654_321));
        assert_eq!(r.read_f32(), Some(2.5));
        assert_eq!(r.read_str().as_deref(), Some("viewer"));
        assert!(!r.has_remaining());
    }

    #[test]
    fn test_reader_returns_none_past_end() {
        let data = [1u8, 2, 3];
        let mut r = WireReader::new(&data);
        assert!(r.read_u16().is_some());
        assert!(r.read_u16().is_none());
        // A failed read does not advance
        assert_eq!(r.position(), 2);
        assert!(r.read_u8().is_some());
    }

    #[test]
    fn test_str_truncates_on_char_boundary() {
        let long = "é".repeat(200); // 400 bytes of 2-byte chars
        let mut w = WireWriter::new();
        w.write_str(&long);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        let decoded = r.read_str().expect("valid utf8");
        assert!(decoded.len() <= 255);
        assert!(long.starts_with(&decoded));
    }

    #[test]
    fn test_list_header() {
        let mut w = WireWriter::new();
        w.write_list_header(3).expect("fits");
        for i in 0..3u32 {
            w.write_u32(i);
        }
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        let count = r.read_list_header().expect("header");
        assert_eq!(count, 3);
        for i in 0..3u32 {
            assert_eq!(r.read_u32(), Some(i));
        }
    }

    #[test]
    fn test_list_header_refuses_oversized_count() {
        let mut w = WireWriter::new();
        w.write_list_header(u16::MAX as usize).expect("at the limit");
        assert!(matches!(
            w.write_list_header(u16::MAX as usize + 1),
            Err(WireError::ListTooLong(_))
        ));
        // The refused header leaves nothing behind
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame {
            kind: FrameKind::Delta,
            tick: 99,
            timestamp_ms: 1_700_000_000_000,
            payload: vec![1, 2, 3, 4, 5],
        };
        let encoded = frame.encode().expect("encode");
        let decoded = Frame::decode(&encoded).expect("decode");
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_frame_kind_tags() {
        for kind in [FrameKind::Full, FrameKind::Delta, FrameKind::Fallback] {
            assert_eq!(FrameKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(FrameKind::from_u8(200), None);
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame {
            kind: FrameKind::Full,
            tick: 0,
            timestamp_ms: 0,
            payload: vec![0u8; MAX_FRAME_SIZE],
        };
        assert!(matches!(
            frame.encode(),
            Err(WireError::FrameTooLarge(_, _))
        ));
    }

    #[test]
    fn test_frame_decode_truncated() {
        let frame = Frame {
            kind: FrameKind::Full,
            tick: 5,
            timestamp_ms: 100,
            payload: vec![9u8; 32],
        };
        let encoded = frame.encode().expect("encode");
        let result = Frame::decode(&encoded[..encoded.len() - 10]);
        assert!(matches!(result, Err(WireError::Truncated(_))));
    }

    #[test]
    fn test_frame_decode_bad_kind() {
        let mut w = WireWriter::new();
        w.write_u8(77);
        w.write_u64(0);
        w.write_u64(0);
        w.write_u32(0);
        let result = Frame::decode(&w.into_bytes());
        assert!(matches!(result, Err(WireError::InvalidKind(77))));
    }
}
