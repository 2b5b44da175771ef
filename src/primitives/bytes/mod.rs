#![forbid(unsafe_code)]
//! Fixed-width and varint helpers over page byte ranges.
//!
//! Page buffers are treated as byte arenas: every accessor takes an explicit
//! offset and checks the range, so a torn or truncated image surfaces as
//! [`StoreError::Corrupted`] instead of a panic.

use crate::types::{Result, StoreError};

pub mod be {
    //! Big-endian accessors at explicit offsets.

    use super::{Result, StoreError};

    fn range<'a>(src: &'a [u8], off: usize, len: usize, what: &'static str) -> Result<&'a [u8]> {
        off.checked_add(len)
            .and_then(|end| src.get(off..end))
            .ok_or(StoreError::Corrupted(what))
    }

    /// Reads one byte.
    pub fn get_u8(src: &[u8], off: usize) -> Result<u8> {
        src.get(off)
            .copied()
            .ok_or(StoreError::Corrupted("u8 field truncated"))
    }

    /// Reads a big-endian u16.
    pub fn get_u16(src: &[u8], off: usize) -> Result<u16> {
        let b = range(src, off, 2, "u16 field truncated")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a big-endian u32.
    pub fn get_u32(src: &[u8], off: usize) -> Result<u32> {
        let b = range(src, off, 4, "u32 field truncated")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian u64.
    pub fn get_u64(src: &[u8], off: usize) -> Result<u64> {
        let b = range(src, off, 8, "u64 field truncated")?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Borrows `len` bytes starting at `off`.
    pub fn get_bytes(src: &[u8], off: usize, len: usize) -> Result<&[u8]> {
        range(src, off, len, "byte range truncated")
    }

    fn range_mut<'a>(dst: &'a mut [u8], off: usize, len: usize) -> Result<&'a mut [u8]> {
        off.checked_add(len)
            .and_then(move |end| dst.get_mut(off..end))
            .ok_or(StoreError::Invalid("destination buffer too small"))
    }

    /// Writes a big-endian u16.
    pub fn put_u16(dst: &mut [u8], off: usize, v: u16) -> Result<()> {
        range_mut(dst, off, 2)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Writes a big-endian u32.
    pub fn put_u32(dst: &mut [u8], off: usize, v: u32) -> Result<()> {
        range_mut(dst, off, 4)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Writes a big-endian u64.
    pub fn put_u64(dst: &mut [u8], off: usize, v: u64) -> Result<()> {
        range_mut(dst, off, 8)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Copies `bytes` to `off`.
    pub fn put_bytes(dst: &mut [u8], off: usize, bytes: &[u8]) -> Result<()> {
        range_mut(dst, off, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

pub mod var {
    //! Unsigned varints and ZigZag signed integers.

    use super::{Result, StoreError};

    /// Number of bytes `v` occupies as an unsigned varint.
    pub fn len_u64(mut v: u64) -> usize {
        let mut n = 1;
        while v >= 0x80 {
            v >>= 7;
            n += 1;
        }
        n
    }

    /// Number of bytes `v` occupies as a ZigZag varint.
    pub fn len_i64(v: i64) -> usize {
        len_u64(zigzag(v))
    }

    fn zigzag(v: i64) -> u64 {
        ((v << 1) ^ (v >> 63)) as u64
    }

    /// Encodes `v` at `off`, returning the number of bytes written.
    pub fn put_u64(dst: &mut [u8], off: usize, mut v: u64) -> Result<usize> {
        let mut written = 0;
        loop {
            let slot = dst
                .get_mut(off + written)
                .ok_or(StoreError::Invalid("destination buffer too small"))?;
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            written += 1;
            if v == 0 {
                *slot = byte;
                return Ok(written);
            }
            *slot = byte | 0x80;
        }
    }

    /// Encodes `v` as ZigZag at `off`, returning the number of bytes written.
    pub fn put_i64(dst: &mut [u8], off: usize, v: i64) -> Result<usize> {
        put_u64(dst, off, zigzag(v))
    }

    /// Decodes an unsigned varint, advancing `off`.
    pub fn get_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(StoreError::Corrupted("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(StoreError::Corrupted("varint overflow"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(StoreError::Corrupted("varint too long"))
    }

    /// Decodes a ZigZag varint, advancing `off`.
    pub fn get_i64(src: &[u8], off: &mut usize) -> Result<i64> {
        let raw = get_u64(src, off)?;
        Ok(((raw >> 1) as i64) ^ (-((raw & 1) as i64)))
    }
}
