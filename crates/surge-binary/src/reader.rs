use crate::error::{BinaryError, Result};
use bytes::Buf;

/// Checks if the buffer has enough remaining bytes before a read.
macro_rules! check_remaining {
    ($buf:expr, $len:expr) => {
        let needed = $len;
        let remaining = $buf.remaining();
        if remaining < needed {
            return Err(BinaryError::UnexpectedEof { needed, remaining });
        }
    };
}

/// Extension trait for `bytes::Buf` implementing the little-endian wire
/// primitives the peer protocol's frames are built from.
pub trait BinaryReader: Buf {
    #[inline]
    fn read_u8(&mut self) -> Result<u8> {
        check_remaining!(self, 1);
        Ok(self.get_u8())
    }

    #[inline]
    fn read_i8(&mut self) -> Result<i8> {
        check_remaining!(self, 1);
        Ok(self.get_i8())
    }

    #[inline]
    fn read_bool(&mut self) -> Result<bool> {
        check_remaining!(self, 1);
        Ok(self.get_u8() != 0)
    }

    #[inline]
    fn read_u16(&mut self) -> Result<u16> {
        check_remaining!(self, 2);
        Ok(self.get_u16_le())
    }

    #[inline]
    fn read_i16(&mut self) -> Result<i16> {
        check_remaining!(self, 2);
        Ok(self.get_i16_le())
    }

    #[inline]
    fn read_u32(&mut self) -> Result<u32> {
        check_remaining!(self, 4);
        Ok(self.get_u32_le())
    }

    #[inline]
    fn read_u64(&mut self) -> Result<u64> {
        check_remaining!(self, 8);
        Ok(self.get_u64_le())
    }

    #[inline]
    fn read_i64(&mut self) -> Result<i64> {
        check_remaining!(self, 8);
        Ok(self.get_i64_le())
    }

    /// Reads `len` raw bytes and returns them as an owned `Vec<u8>`.
    #[inline]
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        check_remaining!(self, len);
        let mut buf = vec![0u8; len];
        self.copy_to_slice(&mut buf);
        Ok(buf)
    }

    /// Reads all remaining bytes in the buffer.
    #[inline]
    fn read_remaining(&mut self) -> Vec<u8> {
        let len = self.remaining();
        let mut buf = vec![0u8; len];
        self.copy_to_slice(&mut buf);
        buf
    }

    /// Reads a `u16`-length-prefixed UTF-8 string.
    #[inline]
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8(bytes)?)
    }
}

impl<T: Buf + ?Sized> BinaryReader for T {}
