//! Wire primitives for V2 payloads
//!
//! All integers are little-endian. Variable-length fields carry a length
//! prefix whose width is part of the field type: STR0_255 and B0_255 use a
//! one-byte prefix, B0_64K a two-byte prefix. U24 is a bare three-byte
//! integer used for frame lengths.

use bytes::{BufMut, BytesMut};

use crate::ProtocolError;

/// Largest value a U24 length field can carry
pub const U24_MAX: u32 = 0x00ff_ffff;

/// Sequential reader over a V2 payload
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> WireReader<'a> {
        WireReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.buf.len() {
            return Err(ProtocolError::MalformedFrame(format!(
                "payload truncated: wanted {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::MalformedFrame(format!(
                "bool field must be 0 or 1, got {}",
                other
            ))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u24(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(3)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_u256(&mut self) -> Result<[u8; 32], ProtocolError> {
        let bytes = self.take(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(arr)
    }

    /// STR0_255: one-byte length prefix, UTF-8 content
    pub fn read_str0_255(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::MalformedFrame("STR0_255 is not UTF-8".into()))
    }

    /// B0_255: one-byte length prefix, raw bytes
    pub fn read_b0_255(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// B0_64K: two-byte length prefix, raw bytes
    pub fn read_b0_64k(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Fails unless the payload was consumed exactly
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::MalformedFrame(format!(
                "{} trailing bytes after payload",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

pub fn put_u24(dst: &mut BytesMut, value: u32) {
    debug_assert!(value <= U24_MAX);
    dst.put_u8((value & 0xff) as u8);
    dst.put_u8(((value >> 8) & 0xff) as u8);
    dst.put_u8(((value >> 16) & 0xff) as u8);
}

pub fn put_str0_255(dst: &mut BytesMut, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(255);
    dst.put_u8(len as u8);
    dst.put_slice(&bytes[..len]);
}

pub fn put_b0_255(dst: &mut BytesMut, value: &[u8]) {
    let len = value.len().min(255);
    dst.put_u8(len as u8);
    dst.put_slice(&value[..len]);
}

pub fn put_b0_64k(dst: &mut BytesMut, value: &[u8]) {
    let len = value.len().min(u16::MAX as usize);
    dst.put_u16_le(len as u16);
    dst.put_slice(&value[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths() {
        let mut dst = BytesMut::new();
        dst.put_u8(0xab);
        dst.put_u16_le(0x1234);
        put_u24(&mut dst, 0x00aabbcc);
        dst.put_u32_le(0xdeadbeef);
        dst.put_u64_le(0x0102030405060708);

        let mut reader = WireReader::new(&dst);
        assert_eq!(reader.read_u8().unwrap(), 0xab);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u24().unwrap(), 0x00aabbcc);
        assert_eq!(reader.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(reader.read_u64().unwrap(), 0x0102030405060708);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_length_prefixed_fields() {
        let mut dst = BytesMut::new();
        put_str0_255(&mut dst, "worker.a");
        put_b0_255(&mut dst, &[1, 2, 3]);
        put_b0_64k(&mut dst, &[9; 300]);

        let mut reader = WireReader::new(&dst);
        assert_eq!(reader.read_str0_255().unwrap(), "worker.a");
        assert_eq!(reader.read_b0_255().unwrap(), vec![1, 2, 3]);
        assert_eq!(reader.read_b0_64k().unwrap(), vec![9; 300]);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut reader = WireReader::new(&[0x01]);
        assert!(reader.read_u32().is_err());
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let reader = WireReader::new(&[0x01]);
        assert!(reader.finish().is_err());
    }

    #[test]
    fn test_bool_rejects_other_values() {
        let mut reader = WireReader::new(&[2]);
        assert!(reader.read_bool().is_err());
    }
}
