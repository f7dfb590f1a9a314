//! Buffered big-endian output stream with position tracking.

use std::io::{BufWriter, Seek, SeekFrom, Write};

use byteorder::{BigEndian, WriteBytesExt};

use crate::util::fixed::{fixed_16_16, fixed_2_30, fixed_8_8};
use crate::util::Result;

use super::FourCc;

/// Output stream for writing QuickTime data.
///
/// All multi-byte integers are written big-endian. The stream tracks
/// its absolute position so atom offsets can be recorded without a
/// round trip through the OS; the wrapped stream does not have to
/// start at position zero.
pub struct QtStream<W: Write + Seek> {
    writer: BufWriter<W>,
    pos: u64,
}

impl<W: Write + Seek> QtStream<W> {
    /// Wrap a stream, picking up its current position.
    pub fn new(mut inner: W) -> Result<Self> {
        let pos = inner.stream_position()?;
        Ok(Self {
            writer: BufWriter::with_capacity(1024 * 1024, inner),
            pos,
        })
    }

    /// Get the current write position.
    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Write bytes and advance position.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.pos += 1;
        Ok(())
    }

    /// Write a u16 value (big-endian).
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.writer.write_u16::<BigEndian>(value)?;
        self.pos += 2;
        Ok(())
    }

    /// Write an i16 value (big-endian).
    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.writer.write_i16::<BigEndian>(value)?;
        self.pos += 2;
        Ok(())
    }

    /// Write a u32 value (big-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<BigEndian>(value)?;
        self.pos += 4;
        Ok(())
    }

    /// Write an i32 value (big-endian).
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.writer.write_i32::<BigEndian>(value)?;
        self.pos += 4;
        Ok(())
    }

    /// Write a u64 value (big-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<BigEndian>(value)?;
        self.pos += 8;
        Ok(())
    }

    /// Write a four-character type code.
    pub fn write_fourcc(&mut self, code: impl Into<FourCc>) -> Result<()> {
        self.write_bytes(&code.into().bytes())
    }

    /// Write a value as unsigned 16.16 fixed point.
    pub fn write_fixed_16_16(&mut self, value: f64) -> Result<()> {
        self.write_u32(fixed_16_16(value))
    }

    /// Write a value as signed 2.30 fixed point.
    pub fn write_fixed_2_30(&mut self, value: f64) -> Result<()> {
        self.write_u32(fixed_2_30(value))
    }

    /// Write a value as unsigned 8.8 fixed point.
    pub fn write_fixed_8_8(&mut self, value: f64) -> Result<()> {
        self.write_u16(fixed_8_8(value))
    }

    /// Write a Pascal string in a fixed-size field: one length byte,
    /// the string bytes, zero padding. Strings longer than
    /// `field_size - 1` bytes are truncated.
    pub fn write_pascal_string(&mut self, s: &str, field_size: usize) -> Result<()> {
        debug_assert!(field_size >= 1 && field_size <= 256);
        let bytes = s.as_bytes();
        let len = bytes.len().min(field_size - 1);
        self.write_u8(len as u8)?;
        self.write_bytes(&bytes[..len])?;
        self.write_zeros(field_size - 1 - len)
    }

    /// Write `count` zero bytes.
    pub fn write_zeros(&mut self, count: usize) -> Result<()> {
        const ZEROS: [u8; 64] = [0u8; 64];
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(ZEROS.len());
            self.write_bytes(&ZEROS[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    /// Seek to an absolute position and return it.
    pub fn seek(&mut self, pos: u64) -> Result<u64> {
        self.writer.flush()?;
        let new_pos = self.writer.seek(SeekFrom::Start(pos))?;
        self.pos = new_pos;
        Ok(new_pos)
    }

    /// Seek to the end of the stream and return the position.
    pub fn seek_end(&mut self) -> Result<u64> {
        self.writer.flush()?;
        let new_pos = self.writer.seek(SeekFrom::End(0))?;
        self.pos = new_pos;
        Ok(new_pos)
    }

    /// Flush the buffer to the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and borrow the underlying stream.
    ///
    /// The caller may reposition it; the tracked position is refreshed
    /// by the next `seek`/`seek_end`.
    pub fn inner_mut(&mut self) -> Result<&mut W> {
        self.writer.flush()?;
        Ok(self.writer.get_mut())
    }

    /// Flush and unwrap the underlying stream.
    pub fn into_inner(self) -> Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(f: impl FnOnce(&mut QtStream<Cursor<Vec<u8>>>)) -> Vec<u8> {
        let mut s = QtStream::new(Cursor::new(Vec::new())).unwrap();
        f(&mut s);
        s.into_inner().unwrap().into_inner()
    }

    #[test]
    fn test_big_endian_integers() {
        let bytes = collect(|s| {
            s.write_u16(0x0102).unwrap();
            s.write_u32(0x0304_0506).unwrap();
            s.write_i32(-2).unwrap();
        });
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 0xff, 0xff, 0xff, 0xfe]);
    }

    #[test]
    fn test_position_tracking() {
        let mut s = QtStream::new(Cursor::new(Vec::new())).unwrap();
        assert_eq!(s.pos(), 0);
        s.write_u64(7).unwrap();
        s.write_fourcc(b"mdat").unwrap();
        assert_eq!(s.pos(), 12);
        s.seek(4).unwrap();
        assert_eq!(s.pos(), 4);
        s.seek_end().unwrap();
        assert_eq!(s.pos(), 12);
    }

    #[test]
    fn test_nonzero_start_position() {
        let mut cursor = Cursor::new(vec![0u8; 5]);
        cursor.seek(SeekFrom::Start(5)).unwrap();
        let s = QtStream::new(cursor).unwrap();
        assert_eq!(s.pos(), 5);
    }

    #[test]
    fn test_pascal_string_field() {
        let bytes = collect(|s| s.write_pascal_string("rle", 8).unwrap());
        assert_eq!(bytes, [3, b'r', b'l', b'e', 0, 0, 0, 0]);

        let bytes = collect(|s| s.write_pascal_string("overlong", 4).unwrap());
        assert_eq!(bytes, [3, b'o', b'v', b'e']);
    }

    #[test]
    fn test_fixed_point_writes() {
        let bytes = collect(|s| {
            s.write_fixed_16_16(1.0).unwrap();
            s.write_fixed_8_8(1.0).unwrap();
        });
        assert_eq!(bytes, [0, 1, 0, 0, 1, 0]);
    }
}
