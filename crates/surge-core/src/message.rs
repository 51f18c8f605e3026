//! The application-facing payload buffer and its pool.
//!
//! `Message` is a small cursor-based wrapper over a `BytesMut`/`Bytes` pair
//! built on the same `surge-binary` extension traits as the wire codec, so
//! application code reads and writes fields with the identical API the
//! protocol layer uses internally.

use crate::header::MessageHeader;
use bytes::{Bytes, BytesMut};
use surge_binary::{BinaryReader, BinaryWriter, Result as BinaryResult};

/// A framed byte buffer for one outbound or inbound user payload.
///
/// Messages are acquired from a `MessagePool` and, once sent (or consumed),
/// returned to it with [`Message::release`]. A message constructed with
/// [`Message::from_bytes`] for an inbound datagram has no pool slot and
/// `release` on it is a no-op — there is nothing to reclaim.
pub struct Message {
    kind: MessageHeader,
    buf: BytesMut,
    read_pos: usize,
    slot: Option<PoolSlot>,
}

#[derive(Clone, Copy)]
struct PoolSlot {
    index: usize,
    generation: u32,
}

impl Message {
    fn new(kind: MessageHeader, buf: BytesMut, slot: Option<PoolSlot>) -> Self {
        Self {
            kind,
            buf,
            read_pos: 0,
            slot,
        }
    }

    /// Wraps inbound payload bytes for reading. Not pool-backed.
    pub fn from_bytes(kind: MessageHeader, bytes: Bytes) -> Self {
        Self::new(kind, BytesMut::from(&bytes[..]), None)
    }

    pub fn kind(&self) -> MessageHeader {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, value: u8) -> BinaryResult<()> {
        self.buf.write_u8(value)
    }

    pub fn write_u16(&mut self, value: u16) -> BinaryResult<()> {
        self.buf.write_u16(value)
    }

    pub fn write_u32(&mut self, value: u32) -> BinaryResult<()> {
        self.buf.write_u32(value)
    }

    pub fn write_i64(&mut self, value: i64) -> BinaryResult<()> {
        self.buf.write_i64(value)
    }

    pub fn write_string(&mut self, value: &str) -> BinaryResult<()> {
        self.buf.write_string(value)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> BinaryResult<()> {
        self.buf.write_bytes(bytes)
    }

    fn remaining(&self) -> &[u8] {
        &self.buf[self.read_pos..]
    }

    pub fn read_u8(&mut self) -> BinaryResult<u8> {
        let mut slice = self.remaining();
        let v = slice.read_u8()?;
        self.read_pos = self.buf.len() - slice.len();
        Ok(v)
    }

    pub fn read_u16(&mut self) -> BinaryResult<u16> {
        let mut slice = self.remaining();
        let v = slice.read_u16()?;
        self.read_pos = self.buf.len() - slice.len();
        Ok(v)
    }

    pub fn read_u32(&mut self) -> BinaryResult<u32> {
        let mut slice = self.remaining();
        let v = slice.read_u32()?;
        self.read_pos = self.buf.len() - slice.len();
        Ok(v)
    }

    pub fn read_i64(&mut self) -> BinaryResult<i64> {
        let mut slice = self.remaining();
        let v = slice.read_i64()?;
        self.read_pos = self.buf.len() - slice.len();
        Ok(v)
    }

    pub fn read_string(&mut self) -> BinaryResult<String> {
        let mut slice = self.remaining();
        let v = slice.read_string()?;
        self.read_pos = self.buf.len() - slice.len();
        Ok(v)
    }

    pub fn read_remaining(&mut self) -> Bytes {
        let bytes = Bytes::copy_from_slice(self.remaining());
        self.read_pos = self.buf.len();
        bytes
    }

    /// Returns this message's bytes to the pool it was acquired from.
    /// A no-op for messages with no pool slot, and a no-op if this slot
    /// was already released (idempotent, per the pool's generation tag).
    pub fn release(mut self, pool: &mut MessagePool) {
        if let Some(slot) = self.slot.take() {
            pool.reclaim(slot.index, slot.generation, std::mem::take(&mut self.buf));
        }
    }
}

struct Slot {
    buf: BytesMut,
    generation: u32,
    taken: bool,
}

/// A free-list pool of reusable `Message` buffers.
///
/// Owned directly by a `Peer`; there is no shared/`Arc` pool handle and no
/// manual active-peer refcount to drop it — ordinary Rust ownership already
/// tears the pool down the moment its owning `Peer` does.
pub struct MessagePool {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl MessagePool {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Acquires a message buffer for outbound use, reusing a pooled
    /// allocation if one is free.
    pub fn acquire(&mut self, kind: MessageHeader) -> Message {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.taken = true;
            let buf = std::mem::take(&mut slot.buf);
            Message::new(
                kind,
                buf,
                Some(PoolSlot {
                    index,
                    generation: slot.generation,
                }),
            )
        } else {
            let index = self.slots.len();
            self.slots.push(Slot {
                buf: BytesMut::new(),
                generation: 0,
                taken: true,
            });
            Message::new(
                kind,
                BytesMut::new(),
                Some(PoolSlot {
                    index,
                    generation: 0,
                }),
            )
        }
    }

    fn reclaim(&mut self, index: usize, generation: u32, mut buf: BytesMut) {
        let slot = &mut self.slots[index];
        if !slot.taken || slot.generation != generation {
            // Already reclaimed under this generation; double release, ignore.
            return;
        }
        buf.clear();
        slot.buf = buf;
        slot.taken = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.taken).count()
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_slots() {
        let mut pool = MessagePool::new();
        let msg = pool.acquire(MessageHeader::Reliable);
        msg.release(&mut pool);
        assert_eq!(pool.live_count(), 0);
        let _msg2 = pool.acquire(MessageHeader::Unreliable);
        assert_eq!(pool.slots.len(), 1);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn double_release_is_idempotent() {
        let mut pool = MessagePool::new();
        let slot = PoolSlot {
            index: 0,
            generation: 0,
        };
        let mut msg = pool.acquire(MessageHeader::Reliable);
        msg.write_u8(7).unwrap();
        let clone_slot = msg.slot.unwrap();
        assert_eq!(clone_slot.index, slot.index);
        msg.release(&mut pool);
        assert_eq!(pool.live_count(), 0);
        // Simulate a stray second release against the stale generation:
        // a no-op, not a panic or corruption of the now-reused slot.
        pool.reclaim(clone_slot.index, clone_slot.generation, BytesMut::new());
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn read_write_round_trip() {
        let mut pool = MessagePool::new();
        let mut msg = pool.acquire(MessageHeader::Reliable);
        msg.write_u16(0xBEEF).unwrap();
        msg.write_string("hi").unwrap();
        assert_eq!(msg.read_u16().unwrap(), 0xBEEF);
        assert_eq!(msg.read_string().unwrap(), "hi");
    }
}
