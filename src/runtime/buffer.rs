//! Growable byte buffer used as the per-connection pending-write queue.
//!
//! Capacity doubles from an initial 32 bytes. All sizing arithmetic is
//! overflow-checked and fails rather than truncating; allocation failure
//! surfaces as an error instead of aborting.

use std::io;

/// Initial capacity of a buffer that has never held data.
const INITIAL_CAPACITY: usize = 32;

/// Growable byte container.
///
/// `erase` clamps past-the-end lengths; every other out-of-range position
/// is an error. Capacity never decreases while the buffer is alive.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Ensure room for `additional` more bytes, doubling capacity from
    /// the initial 32 until it fits.
    pub fn reserve(&mut self, additional: usize) -> io::Result<()> {
        let needed = self
            .data
            .len()
            .checked_add(additional)
            .ok_or_else(overflow)?;

        if needed <= self.data.capacity() {
            return Ok(());
        }

        let mut capacity = if self.data.capacity() == 0 {
            INITIAL_CAPACITY
        } else {
            self.data.capacity().checked_mul(2).ok_or_else(overflow)?
        };
        while capacity < needed {
            capacity = capacity.checked_mul(2).ok_or_else(overflow)?;
        }

        self.data
            .try_reserve_exact(capacity - self.data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "buffer allocation failed"))
    }

    /// Append `data` at the end.
    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.reserve(data.len())?;
        self.data.extend_from_slice(data);
        Ok(())
    }

    /// Insert `data` at `pos`, shifting the tail right.
    pub fn insert(&mut self, pos: usize, data: &[u8]) -> io::Result<()> {
        if pos > self.data.len() {
            return Err(out_of_range(pos));
        }
        self.reserve(data.len())?;
        self.data.splice(pos..pos, data.iter().copied());
        Ok(())
    }

    /// Erase up to `n` bytes starting at `pos`; `n` past the end is
    /// clamped.
    pub fn erase(&mut self, pos: usize, n: usize) -> io::Result<()> {
        if pos > self.data.len() {
            return Err(out_of_range(pos));
        }
        let end = pos.checked_add(n).map_or(self.data.len(), |e| e.min(self.data.len()));
        self.data.drain(pos..end);
        Ok(())
    }

    /// Replace up to `n` bytes at `pos` with `data`; `n` past the end is
    /// clamped.
    pub fn replace(&mut self, pos: usize, n: usize, data: &[u8]) -> io::Result<()> {
        if pos > self.data.len() {
            return Err(out_of_range(pos));
        }
        let end = pos.checked_add(n).map_or(self.data.len(), |e| e.min(self.data.len()));
        if data.len() > end - pos {
            self.reserve(data.len() - (end - pos))?;
        }
        self.data.splice(pos..end, data.iter().copied());
        Ok(())
    }

    /// Resize to `n` bytes, zero-filling any growth.
    pub fn resize(&mut self, n: usize) -> io::Result<()> {
        if n > self.data.len() {
            self.reserve(n - self.data.len())?;
        }
        self.data.resize(n, 0);
        Ok(())
    }
}

fn overflow() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "buffer length overflow")
}

fn out_of_range(pos: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("position {pos} past end of buffer"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_growth() {
        let mut buf = ByteBuffer::new();
        assert_eq!(buf.capacity(), 0);

        buf.append(b"hello").unwrap();
        assert_eq!(buf.as_slice(), b"hello");
        assert_eq!(buf.capacity(), 32);

        // Crossing 32 bytes doubles to 64.
        buf.append(&[0u8; 30]).unwrap();
        assert_eq!(buf.len(), 35);
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_capacity_monotonic() {
        let mut buf = ByteBuffer::new();
        let mut last = 0;
        for n in [1, 10, 100, 50, 1000, 1] {
            buf.reserve(n).unwrap();
            assert!(buf.capacity() >= last);
            last = buf.capacity();
        }
    }

    #[test]
    fn test_insert() {
        let mut buf = ByteBuffer::new();
        buf.append(b"held").unwrap();
        buf.insert(2, b"llo wor").unwrap();
        assert_eq!(buf.as_slice(), b"hello world");

        buf.insert(buf.len(), b"!").unwrap();
        assert_eq!(buf.as_slice(), b"hello world!");

        assert!(buf.insert(100, b"x").is_err());
    }

    #[test]
    fn test_erase_clamps() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello world").unwrap();

        buf.erase(5, 6).unwrap();
        assert_eq!(buf.as_slice(), b"hello");

        // Past-the-end length clamps to the remainder.
        buf.erase(3, 1000).unwrap();
        assert_eq!(buf.as_slice(), b"hel");

        buf.erase(3, usize::MAX).unwrap();
        assert_eq!(buf.as_slice(), b"hel");

        assert!(buf.erase(4, 1).is_err());
    }

    #[test]
    fn test_erase_front_shifts() {
        let mut buf = ByteBuffer::new();
        buf.append(b"abcdef").unwrap();
        buf.erase(0, 2).unwrap();
        assert_eq!(buf.as_slice(), b"cdef");
    }

    #[test]
    fn test_replace() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello world").unwrap();

        buf.replace(6, 5, b"there").unwrap();
        assert_eq!(buf.as_slice(), b"hello there");

        // Shrinking replacement.
        buf.replace(0, 5, b"hi").unwrap();
        assert_eq!(buf.as_slice(), b"hi there");

        // Growing replacement with clamped n.
        buf.replace(3, usize::MAX, b"everyone").unwrap();
        assert_eq!(buf.as_slice(), b"hi everyone");

        assert!(buf.replace(100, 1, b"x").is_err());
    }

    #[test]
    fn test_resize() {
        let mut buf = ByteBuffer::new();
        buf.append(b"abc").unwrap();

        buf.resize(6).unwrap();
        assert_eq!(buf.as_slice(), b"abc\0\0\0");

        buf.resize(2).unwrap();
        assert_eq!(buf.as_slice(), b"ab");
    }

    #[test]
    fn test_overflow_detected() {
        let mut buf = ByteBuffer::new();
        buf.append(b"x").unwrap();
        assert!(buf.reserve(usize::MAX).is_err());
        assert!(buf.erase(0, usize::MAX).is_ok());
    }
}
