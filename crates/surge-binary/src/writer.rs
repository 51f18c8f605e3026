use crate::error::{BinaryError, Result};
use bytes::BufMut;

/// Extension trait for `bytes::BufMut` implementing the little-endian wire
/// primitives the peer protocol's frames are built from.
pub trait BinaryWriter: BufMut {
    #[inline]
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.put_u8(value);
        Ok(())
    }

    #[inline]
    fn write_i8(&mut self, value: i8) -> Result<()> {
        self.put_i8(value);
        Ok(())
    }

    #[inline]
    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.put_u8(value as u8);
        Ok(())
    }

    #[inline]
    fn write_u16(&mut self, value: u16) -> Result<()> {
        self.put_u16_le(value);
        Ok(())
    }

    #[inline]
    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.put_i16_le(value);
        Ok(())
    }

    #[inline]
    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.put_u32_le(value);
        Ok(())
    }

    #[inline]
    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.put_u64_le(value);
        Ok(())
    }

    #[inline]
    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.put_i64_le(value);
        Ok(())
    }

    #[inline]
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_slice(bytes);
        Ok(())
    }

    /// Writes a `u16`-length-prefixed UTF-8 string.
    #[inline]
    fn write_string(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        let len: u16 = bytes
            .len()
            .try_into()
            .map_err(|_| BinaryError::InvalidLength(bytes.len()))?;
        self.write_u16(len)?;
        self.write_bytes(bytes)
    }
}

impl<T: BufMut + ?Sized> BinaryWriter for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn writes_little_endian_integers() {
        let mut buf = BytesMut::new();
        buf.write_u16(0x0302).unwrap();
        buf.write_u32(0x08070605).unwrap();
        assert_eq!(
            &buf[..],
            &[0x02, 0x03, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn rejects_oversized_string() {
        let mut buf = BytesMut::new();
        let huge = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            buf.write_string(&huge),
            Err(BinaryError::InvalidLength(_))
        ));
    }
}
