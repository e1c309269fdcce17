//! Big-endian field cursor used by every wire structure.

use crate::error::{Result, VnicError};

/// Appends big-endian fields to a byte vector.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Write `v` into a fixed-width field, truncating or zero-padding.
    pub fn fixed(&mut self, v: &[u8], width: usize) -> &mut Self {
        let n = v.len().min(width);
        self.buf.extend_from_slice(&v[..n]);
        self.zeros(width - n)
    }

    pub fn zeros(&mut self, n: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + n, 0);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads big-endian fields from a byte slice, failing with
/// [`VnicError::Decode`] on truncation.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(VnicError::decode(format!(
                "{}: truncated at offset {} (need {n}, have {})",
                self.what,
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let b = self.take(N)?;
        let mut a = [0u8; N];
        a.copy_from_slice(b);
        Ok(a)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Read a fixed-width, NUL-padded text field.
    pub fn text(&mut self, width: usize) -> Result<String> {
        let b = self.take(width)?;
        let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
        Ok(String::from_utf8_lossy(&b[..end]).into_owned())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut w = WireWriter::default();
        w.u8(0xab).u16(0x0102).u32(0x0304_0506).u64(0x0708_090a_0b0c_0d0e);
        let buf = w.finish();
        assert_eq!(
            buf,
            [0xab, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14]
        );
        let mut r = WireReader::new(&buf, "test");
        assert_eq!(r.u8().unwrap(), 0xab);
        assert_eq!(r.u16().unwrap(), 0x0102);
        assert_eq!(r.u32().unwrap(), 0x0304_0506);
        assert_eq!(r.u64().unwrap(), 0x0708_090a_0b0c_0d0e);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_truncation_is_decode_error() {
        let mut r = WireReader::new(&[1, 2, 3], "short");
        assert!(r.u16().is_ok());
        let err = r.u16().unwrap_err();
        assert!(err.to_string().contains("short: truncated"));
    }

    #[test]
    fn test_fixed_text_field() {
        let mut w = WireWriter::default();
        w.fixed(b"host-a", 8).fixed(b"too-long-name", 4);
        let buf = w.finish();
        assert_eq!(buf.len(), 12);
        let mut r = WireReader::new(&buf, "text");
        assert_eq!(r.text(8).unwrap(), "host-a");
        assert_eq!(r.text(4).unwrap(), "too-");
    }
}
