//! Little-endian binary codec primitives shared by the wire format and the
//! `Message` buffer. Built as extension traits over `bytes::Buf`/`BufMut`
//! so any buffer type (`Bytes`, `BytesMut`, a `&[u8]` slice) gets the same
//! typed read/write surface for free.

mod error;
mod reader;
mod writer;

pub use error::{BinaryError, Result};
pub use reader::BinaryReader;
pub use writer::BinaryWriter;
