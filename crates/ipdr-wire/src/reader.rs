//! Bounds-checked big-endian reader over a byte slice.

use byteorder::{BigEndian, ByteOrder};

use crate::{WireError, WireResult};

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                need: self.pos + n,
                got: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> WireResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub(crate) fn u32(&mut self) -> WireResult<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub(crate) fn u64(&mut self) -> WireResult<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Length-prefixed opaque field.
    pub(crate) fn opaque(&mut self) -> WireResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Length-prefixed UTF-8 string.
    pub(crate) fn string(&mut self) -> WireResult<String> {
        String::from_utf8(self.opaque()?).map_err(|_| WireError::InvalidString)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_truncated() {
        let mut r = Reader::new(&[0x00, 0x01, 0x02]);
        assert_eq!(r.u16().unwrap(), 1);
        let err = r.u32().unwrap_err();
        assert!(matches!(err, WireError::Truncated { need: 6, got: 3 }));
    }

    #[test]
    fn test_reader_string() {
        let mut r = Reader::new(&[0, 0, 0, 2, b'h', b'i']);
        assert_eq!(r.string().unwrap(), "hi");
        assert_eq!(r.remaining(), 0);
    }
}
