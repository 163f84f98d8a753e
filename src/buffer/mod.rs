//! Reusable byte buffer for frame encoding and decoding.
//!
//! The TCP transport keeps one of these per direction for the lifetime of a
//! connection, so the steady-state send and receive paths do not allocate once
//! the buffer has grown to fit the largest frame seen.

use std::io::{self, Read, Write};

/// Default buffer size: 64KB
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A growable byte buffer with separate read and write cursors.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    /// Bytes before this have been consumed.
    read_pos: usize,
    /// Bytes up to here are valid.
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes available to read.
    #[inline]
    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes that can be appended without compacting or growing.
    #[inline]
    pub fn writable(&self) -> usize {
        self.data.len() - self.write_pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Advances the read position.
    ///
    /// # Panics
    /// Panics if `n` exceeds the readable bytes.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.readable(), "consume exceeds readable bytes");
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Moves unread data to the start of the buffer.
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let readable = self.readable();
        if readable > 0 {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
        }
        self.read_pos = 0;
        self.write_pos = readable;
    }

    /// Ensures at least `needed` bytes can be appended, compacting first and
    /// doubling the capacity only if that is not enough.
    pub fn reserve(&mut self, needed: usize) {
        if self.writable() >= needed {
            return;
        }
        self.compact();
        if self.writable() >= needed {
            return;
        }

        let readable = self.readable();
        let new_capacity = (self.capacity() * 2).max(readable + needed);
        let mut new_data = vec![0u8; new_capacity].into_boxed_slice();
        new_data[..readable].copy_from_slice(&self.data[..readable]);
        self.data = new_data;
    }

    /// Appends `data`, growing if required.
    pub fn put_slice(&mut self, data: &[u8]) {
        self.reserve(data.len());
        self.data[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn put_u32_le(&mut self, v: u32) {
        self.put_slice(&v.to_le_bytes());
    }

    pub fn put_u64_le(&mut self, v: u64) {
        self.put_slice(&v.to_le_bytes());
    }

    /// Reads once from `reader` into the spare space.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end of stream.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.writable() < self.capacity() / 4 {
            self.compact();
        }
        if self.writable() == 0 {
            self.reserve(self.capacity());
        }
        let n = reader.read(&mut self.data[self.write_pos..])?;
        self.write_pos += n;
        Ok(n)
    }

    /// Writes all readable bytes to `writer` and empties the buffer.
    pub fn write_all_to<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        writer.write_all(self.as_slice())?;
        self.clear();
        Ok(())
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_consume() {
        let mut buf = Buffer::with_capacity(1024);
        assert!(buf.is_empty());

        buf.put_slice(b"hello");
        buf.put_u32_le(7);
        assert_eq!(buf.readable(), 9);
        assert_eq!(&buf.as_slice()[..5], b"hello");

        buf.consume(5);
        assert_eq!(buf.as_slice(), &7u32.to_le_bytes());
    }

    #[test]
    fn test_reserve_compacts_before_growing() {
        let mut buf = Buffer::with_capacity(16);
        buf.put_slice(b"hello world!");
        buf.consume(6);

        buf.reserve(8);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.as_slice(), b"world!");
    }

    #[test]
    fn test_put_grows_past_capacity() {
        let mut buf = Buffer::with_capacity(4);
        buf.put_slice(b"0123456789");
        assert!(buf.capacity() >= 10);
        assert_eq!(buf.as_slice(), b"0123456789");
    }

    #[test]
    fn test_read_from_and_write_all_to() {
        let mut buf = Buffer::with_capacity(8);
        let mut src: &[u8] = b"frame";
        assert_eq!(buf.read_from(&mut src).unwrap(), 5);
        assert_eq!(buf.read_from(&mut src).unwrap(), 0);

        let mut out = Vec::new();
        buf.write_all_to(&mut out).unwrap();
        assert_eq!(out, b"frame");
        assert!(buf.is_empty());
        assert_eq!(buf.writable(), 8);
    }
}
