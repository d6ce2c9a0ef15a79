//! V2 frame layout and stream codec
//!
//! Every wire unit carries a fixed six-byte header: extension type (two
//! bytes little-endian), message type (one byte), and payload length (three
//! bytes little-endian). The payload follows immediately.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::wire::{self, U24_MAX};
use crate::ProtocolError;

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 6;

/// Largest payload the server accepts in one frame
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Extension type for the base mining protocol
pub const EXTENSION_MINING: u16 = 0x0000;

/// Fixed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol extension the message belongs to
    pub extension_type: u16,
    /// Message discriminant within the extension
    pub message_type: u8,
    /// Payload length (24-bit)
    pub length: u32,
}

impl FrameHeader {
    /// Parse a header from exactly six bytes
    pub fn parse(bytes: &[u8]) -> Result<FrameHeader, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedFrame(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        Ok(FrameHeader {
            extension_type: u16::from_le_bytes([bytes[0], bytes[1]]),
            message_type: bytes[2],
            length: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], 0]),
        })
    }

    /// Whether the declared payload length is acceptable
    pub fn length_in_bounds(&self) -> bool {
        self.length as usize <= MAX_FRAME_PAYLOAD && self.length <= U24_MAX
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.extension_type);
        dst.put_u8(self.message_type);
        wire::put_u24(dst, self.length);
    }
}

/// One decoded frame: header plus payload bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Frame a payload under the base mining extension
    pub fn new(message_type: u8, payload: Bytes) -> Frame {
        Frame {
            header: FrameHeader {
                extension_type: EXTENSION_MINING,
                message_type,
                length: payload.len() as u32,
            },
            payload,
        }
    }

    /// Serialize header and payload into one buffer
    pub fn encode(&self) -> BytesMut {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.write(&mut dst);
        dst.put_slice(&self.payload);
        dst
    }
}

/// Stream codec for plaintext V2 frames
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = FrameHeader::parse(&src[..HEADER_SIZE])?;
        if !header.length_in_bounds() {
            return Err(ProtocolError::OversizedFrame(header.length as usize));
        }
        let frame_len = HEADER_SIZE + header.length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let payload = src.split_to(header.length as usize).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::OversizedFrame(frame.payload.len()));
        }
        dst.reserve(HEADER_SIZE + frame.payload.len());
        frame.header.write(dst);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader {
            extension_type: 0x0000,
            message_type: 0x1e,
            length: 0x123456,
        };
        let mut bytes = BytesMut::new();
        header.write(&mut bytes);
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(FrameHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_codec_roundtrip() {
        let frame = Frame::new(0x1a, Bytes::from_static(&[1, 2, 3, 4]));
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_waits_for_full_frame() {
        let frame = Frame::new(0x00, Bytes::from_static(&[9; 16]));
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let mut partial = buf.split_to(10);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(frame));
    }

    #[test]
    fn test_oversized_declared_length_rejected() {
        let mut buf = BytesMut::new();
        // header declaring a 16 MiB payload
        buf.put_u16_le(0);
        buf.put_u8(0x1a);
        buf.put_slice(&[0xff, 0xff, 0xff]);
        let mut codec = FrameCodec;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedFrame(_))
        ));
    }
}
