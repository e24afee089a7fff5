//! Byte stream with a sticky error flag.
//!
//! `Bs` owns a growable append buffer for writes and a read position for
//! gets. Every operation is guarded by the sticky error flag: once an
//! operation fails, later mutating calls are no-ops and every get returns
//! zero. The accumulated error surfaces as an `io::Error` at the points
//! where a parser finishes ([`Bs::status`]).
use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

// Grow the internal buffer in chunks of this size.
const BS_ALLOC_CHUNK: usize = 1 << 16;

/// Backend a `Bs` flushes to and reads from.
pub trait BsStream: Read + Write + Seek {}
impl<T: Read + Write + Seek> BsStream for T {}

/// Byte stream writer/reader.
pub struct Bs {
    buffer:  Vec<u8>,
    pos:     usize,
    written: u64,
    offset:  u64,
    error:   bool,
    stream:  Option<Box<dyn BsStream>>,
}

impl Bs {
    /// An in-memory byte stream without a backend.
    pub fn new() -> Bs {
        Bs {
            buffer:  Vec::new(),
            pos:     0,
            written: 0,
            offset:  0,
            error:   false,
            stream:  None,
        }
    }

    /// A byte stream backed by `stream` for flush/read/seek.
    pub fn with_stream(stream: Box<dyn BsStream>) -> Bs {
        let mut bs = Bs::new();
        bs.stream = Some(stream);
        bs
    }

    #[inline]
    pub fn error(&self) -> bool {
        self.error
    }

    #[inline]
    pub fn set_error(&mut self) {
        self.error = true;
    }

    /// The sticky error as an `io::Result`.
    pub fn status(&self) -> io::Result<()> {
        if self.error {
            Err(ioerr!(InvalidData, "byte stream in error state"))
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Number of bytes currently stored.
    #[inline]
    pub fn store(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all stored bytes and reset the read position.
    pub fn empty(&mut self) {
        self.buffer.clear();
        self.pos = 0;
    }

    fn alloc(&mut self, size: usize) {
        if self.buffer.capacity() >= size || self.error {
            return;
        }
        self.buffer.reserve(size + BS_ALLOC_CHUNK - self.buffer.len());
    }

    /*---- writer ----*/

    pub fn put_byte(&mut self, value: u8) {
        self.alloc(self.buffer.len() + 1);
        if self.error {
            return;
        }
        self.buffer.push(value);
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        if value.is_empty() {
            return;
        }
        self.alloc(self.buffer.len() + value.len());
        if self.error {
            return;
        }
        self.buffer.extend_from_slice(value);
    }

    pub fn put_be16(&mut self, value: u16) {
        let mut b = [0u8; 2];
        BigEndian::write_u16(&mut b, value);
        self.put_bytes(&b);
    }

    pub fn put_be24(&mut self, value: u32) {
        let mut b = [0u8; 3];
        BigEndian::write_u24(&mut b, value);
        self.put_bytes(&b);
    }

    pub fn put_be32(&mut self, value: u32) {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, value);
        self.put_bytes(&b);
    }

    pub fn put_be64(&mut self, value: u64) {
        let mut b = [0u8; 8];
        BigEndian::write_u64(&mut b, value);
        self.put_bytes(&b);
    }

    pub fn put_le16(&mut self, value: u16) {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, value);
        self.put_bytes(&b);
    }

    pub fn put_le32(&mut self, value: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, value);
        self.put_bytes(&b);
    }

    /// Write the stored bytes to the backend and reset the store.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.error {
            return self.status();
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => {
                self.error = true;
                return Err(ioerr!(InvalidInput, "no backend stream to flush to"));
            },
        };
        if let Err(e) = stream.write_all(&self.buffer) {
            self.error = true;
            return Err(e);
        }
        self.written += self.buffer.len() as u64;
        self.offset += self.buffer.len() as u64;
        self.buffer.clear();
        self.pos = 0;
        Ok(())
    }

    /// Copy out the stored bytes.
    pub fn export_data(&self) -> Option<Vec<u8>> {
        if self.error || self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.clone())
    }

    /*---- reader ----*/

    /// Peek at the byte `offset` bytes past the read position.
    pub fn show_byte(&mut self, offset: usize) -> u8 {
        if self.error {
            return 0;
        }
        if self.pos + offset >= self.buffer.len() {
            self.error = true;
            return 0;
        }
        self.buffer[self.pos + offset]
    }

    pub fn get_byte(&mut self) -> u8 {
        if self.error {
            return 0;
        }
        if self.pos + 1 > self.buffer.len() {
            self.error = true;
            return 0;
        }
        let v = self.buffer[self.pos];
        self.pos += 1;
        v
    }

    pub fn skip_bytes(&mut self, size: usize) {
        if self.error || size == 0 {
            return;
        }
        if self.pos + size > self.buffer.len() {
            self.error = true;
            return;
        }
        self.pos += size;
    }

    pub fn get_bytes(&mut self, size: usize) -> Vec<u8> {
        if self.error || size == 0 {
            return Vec::new();
        }
        if self.pos + size > self.buffer.len() {
            self.error = true;
            return Vec::new();
        }
        let v = self.buffer[self.pos..self.pos + size].to_vec();
        self.pos += size;
        v
    }

    pub fn get_be16(&mut self) -> u16 {
        let value = self.get_byte() as u16;
        (value << 8) | self.get_byte() as u16
    }

    pub fn get_be24(&mut self) -> u32 {
        let value = self.get_byte() as u32;
        (value << 16) | self.get_be16() as u32
    }

    pub fn get_be32(&mut self) -> u32 {
        let value = self.get_be16() as u32;
        (value << 16) | self.get_be16() as u32
    }

    pub fn get_be64(&mut self) -> u64 {
        let value = self.get_be32() as u64;
        (value << 32) | self.get_be32() as u64
    }

    /// Append up to `size` bytes from the backend into the store.
    pub fn read(&mut self, size: usize) -> io::Result<usize> {
        if size == 0 {
            return Ok(0);
        }
        self.alloc(self.buffer.len() + size);
        if self.error {
            return self.status().map(|_| 0);
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => {
                self.error = true;
                return Err(ioerr!(InvalidInput, "no backend stream to read from"));
            },
        };
        let old_len = self.buffer.len();
        self.buffer.resize(old_len + size, 0);
        let mut nread = 0;
        while nread < size {
            match stream.read(&mut self.buffer[old_len + nread..]) {
                Ok(0) => break,
                Ok(n) => nread += n,
                Err(e) => {
                    self.buffer.truncate(old_len);
                    self.error = true;
                    return Err(e);
                },
            }
        }
        self.buffer.truncate(old_len + nread);
        self.offset += nread as u64;
        Ok(nread)
    }

    /// Append `data` into the store.
    pub fn import_data(&mut self, data: &[u8]) -> io::Result<()> {
        if self.error {
            return self.status();
        }
        if data.is_empty() {
            return Err(ioerr!(InvalidInput, "no data to import"));
        }
        self.alloc(self.buffer.len() + data.len());
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Seek the backend and reconcile `offset` with `written`.
    pub fn seek(&mut self, offset: i64, whence: SeekFrom) -> io::Result<u64> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ioerr!(InvalidInput, "stream is unseekable"))?;
        let ret = stream.seek(match whence {
            SeekFrom::Start(_) => SeekFrom::Start(offset as u64),
            SeekFrom::Current(_) => SeekFrom::Current(offset),
            SeekFrom::End(_) => SeekFrom::End(offset),
        })?;
        match whence {
            SeekFrom::Start(_) => {
                self.offset = (offset as u64).min(self.written);
            },
            SeekFrom::Current(_) => {
                if offset < 0 && self.offset < (-offset) as u64 {
                    self.offset = 0;
                } else if offset > 0 && self.written < self.offset + offset as u64 {
                    self.offset = self.written;
                } else {
                    self.offset = (self.offset as i64 + offset) as u64;
                }
            },
            SeekFrom::End(_) => {
                if self.written < (-offset) as u64 {
                    self.offset = 0;
                } else {
                    self.offset = (self.written as i64 + offset) as u64;
                }
            },
        }
        Ok(ret)
    }

    /// Bytes written to the backend so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// The stored bytes not read yet.
    pub(crate) fn remaining_slice(&self) -> &[u8] {
        &self.buffer[self.pos.min(self.buffer.len())..]
    }
}

impl Default for Bs {
    fn default() -> Bs {
        Bs::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let mut bs = Bs::new();
        bs.put_byte(0x0b);
        bs.put_be16(0x7700);
        bs.put_be24(0x0102_03);
        bs.put_be32(0xdead_beef);
        bs.put_be64(0x0123_4567_89ab_cdef);
        bs.put_le16(0x3412);
        bs.put_le32(0x7856_3412);
        assert!(!bs.error());
        assert_eq!(bs.get_byte(), 0x0b);
        assert_eq!(bs.get_be16(), 0x7700);
        assert_eq!(bs.get_be24(), 0x0102_03);
        assert_eq!(bs.get_be32(), 0xdead_beef);
        assert_eq!(bs.get_be64(), 0x0123_4567_89ab_cdef);
        assert_eq!(&bs.get_bytes(2), &[0x12, 0x34]);
        assert_eq!(&bs.get_bytes(4), &[0x12, 0x34, 0x56, 0x78]);
        assert!(bs.status().is_ok());
    }

    #[test]
    fn over_read_is_sticky() {
        let mut bs = Bs::new();
        bs.put_be16(0xfff1);
        assert_eq!(bs.get_be32(), 0);
        assert!(bs.error());
        // Mutating operations become no-ops.
        bs.put_byte(0xff);
        assert_eq!(bs.store(), 2);
        assert_eq!(bs.get_byte(), 0);
        assert!(bs.status().is_err());
    }

    #[test]
    fn show_byte_does_not_advance() {
        let mut bs = Bs::new();
        bs.put_bytes(&[1, 2, 3]);
        assert_eq!(bs.show_byte(1), 2);
        assert_eq!(bs.get_byte(), 1);
    }
}
