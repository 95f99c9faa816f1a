//! Bounds-checked cursor over an in-memory buffer.

use std::io::Cursor;

use binrw::{BinRead, Endian};

use crate::error::{FormatError, Result};

/// A fixed-layout on-disk structure with a declared byte size.
pub trait Record: Sized {
    /// Exact size of the structure on disk.
    const SIZE: usize;
}

/// Byte cursor. Every read advances by exactly the requested size or
/// fails with [`FormatError::Truncated`] without moving.
pub struct ByteSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Move to an absolute position. `pos == len` is allowed.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(self.truncated(pos.saturating_sub(self.pos)));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read(n).map(|_| ())
    }

    fn truncated(&self, wanted: usize) -> FormatError {
        FormatError::Truncated { pos: self.pos, wanted, len: self.data.len() }
    }

    /// Read exactly `n` bytes.
    pub fn read(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(self.truncated(n)),
        }
    }

    /// Read a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i16_le(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_f32_le(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Fixed-width text field, cut at the first NUL.
    pub fn read_string(&mut self, n: usize) -> Result<String> {
        Ok(latin1(self.read(n)?))
    }

    /// Text with a one-byte length prefix.
    pub fn read_pascal_string(&mut self) -> Result<String> {
        let n = self.read_u8()? as usize;
        self.read_string(n)
    }

    /// NUL-terminated text.
    pub fn read_null_string(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(n) => {
                let s = latin1(&rest[..n]);
                self.pos += n + 1;
                Ok(s)
            }
            None => Err(self.truncated(rest.len() + 1)),
        }
    }

    /// Read one fixed-layout record: exactly `T::SIZE` bytes.
    pub fn read_record<T>(&mut self) -> Result<T>
    where
        T: Record + for<'b> BinRead<Args<'b> = ()>,
    {
        let bytes = self.read(T::SIZE)?;
        parse_record(bytes)
    }
}

/// Parse a record from a slice holding at least `T::SIZE` bytes.
pub fn parse_record<T>(bytes: &[u8]) -> Result<T>
where
    T: Record + for<'b> BinRead<Args<'b> = ()>,
{
    if bytes.len() < T::SIZE {
        return Err(FormatError::Truncated { pos: 0, wanted: T::SIZE, len: bytes.len() });
    }
    let mut cursor = Cursor::new(&bytes[..T::SIZE]);
    let value = T::read_options(&mut cursor, Endian::Little, ())
        .map_err(|e| FormatError::invalid(format!("malformed record: {e}")))?;
    debug_assert_eq!(cursor.position() as usize, T::SIZE);
    Ok(value)
}

/// Decode 8-bit text as Latin-1, stopping at the first NUL.
pub fn latin1(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect()
}

/// Text stored as a Pascal `String[N]`: length byte then up to N chars.
pub fn pascal(bytes: &[u8]) -> String {
    match bytes.split_first() {
        Some((&len, rest)) => latin1(&rest[..(len as usize).min(rest.len())]),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::BinRead;

    #[derive(BinRead, Debug, PartialEq)]
    #[br(little)]
    struct Pair {
        a: u16,
        b: [u8; 3],
    }

    impl Record for Pair {
        const SIZE: usize = 5;
    }

    #[test]
    fn reads_advance_exactly() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let mut r = ByteSource::new(&data);
        assert_eq!(r.read_u16_le().unwrap(), 0x0201);
        assert_eq!(r.tell(), 2);
        assert_eq!(r.read_u32_be().unwrap(), 0x03040506);
        assert!(r.at_end());
    }

    #[test]
    fn short_read_fails_without_moving() {
        let data = [1u8, 2, 3];
        let mut r = ByteSource::new(&data);
        r.skip(2).unwrap();
        let err = r.read_u16_le().unwrap_err();
        assert_eq!(err, FormatError::Truncated { pos: 2, wanted: 2, len: 3 });
        assert_eq!(r.tell(), 2);
    }

    #[test]
    fn seek_past_end_rejected() {
        let data = [0u8; 4];
        let mut r = ByteSource::new(&data);
        assert!(r.seek(4).is_ok());
        assert!(r.seek(5).is_err());
        assert_eq!(r.tell(), 4);
    }

    #[test]
    fn huge_read_does_not_overflow() {
        let data = [0u8; 4];
        let mut r = ByteSource::new(&data);
        r.skip(1).unwrap();
        assert!(r.read(usize::MAX).is_err());
    }

    #[test]
    fn strings() {
        let data = b"AB\0CD\x03xyzQ\0";
        let mut r = ByteSource::new(data);
        assert_eq!(r.read_string(5).unwrap(), "AB");
        assert_eq!(r.read_pascal_string().unwrap(), "xyz");
        assert_eq!(r.read_null_string().unwrap(), "Q");
        assert!(r.at_end());
        assert_eq!(pascal(b"\x02hiXX"), "hi");
    }

    #[test]
    fn record_reads_declared_size() {
        let data = [0x34u8, 0x12, 7, 8, 9, 0xFF];
        let mut r = ByteSource::new(&data);
        let p: Pair = r.read_record().unwrap();
        assert_eq!(p, Pair { a: 0x1234, b: [7, 8, 9] });
        assert_eq!(r.tell(), Pair::SIZE);
        assert!(r.read_record::<Pair>().is_err());
    }
}
