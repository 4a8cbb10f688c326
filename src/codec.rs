//! Cursor-based binary codec
//!
//! Every wire format in dipa-link is a flat sequence of fixed-width
//! little-endian fields. [`BytesReader`] and [`BytesWriter`] are the one
//! place bounds-checking lives; the framing and connector modules never do
//! manual offset arithmetic.
//!
//! Cursor repositioning via [`BytesReader::forward`] / [`BytesReader::back`]
//! clamps to the buffer's bounds instead of failing. Dependents rely on the
//! clamp-to-end behavior, so it is kept as-is.

use crate::error::{Error, Result};

/// Reader with a monotonic cursor over a fixed byte buffer
pub struct BytesReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> BytesReader<'a> {
    /// Wrap a buffer with the cursor at offset 0
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    /// Current cursor offset
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Bytes left between the cursor and the end of the buffer
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Assemble an integer from `byte_count` little-endian bytes without
    /// advancing the cursor.
    ///
    /// If `signed` and the top bit of the most significant byte is set, the
    /// result is the two's-complement negative value. Fails with
    /// `OutOfRange` if `byte_count > 8`, if the read would pass the end of
    /// the buffer, or if an unsigned 8-byte value does not fit an exact
    /// `i64` (use [`read_u64`](Self::read_u64) for the full range).
    pub fn peek(&self, byte_count: usize, signed: bool) -> Result<i64> {
        if byte_count > 8 {
            return Err(Error::OutOfRange(format!(
                "peek width {} exceeds 8 bytes",
                byte_count
            )));
        }
        if self.cursor + byte_count > self.buf.len() {
            return Err(Error::OutOfRange(format!(
                "read of {} bytes at offset {} passes end of {}-byte buffer",
                byte_count,
                self.cursor,
                self.buf.len()
            )));
        }

        let mut value: u64 = 0;
        for i in 0..byte_count {
            value |= (self.buf[self.cursor + i] as u64) << (8 * i);
        }

        if signed && byte_count > 0 && (self.buf[self.cursor + byte_count - 1] & 0x80) != 0 {
            if byte_count == 8 {
                // The u64 bit pattern already is the i64 two's complement
                return Ok(value as i64);
            }
            return Ok(value as i64 - (1i64 << (8 * byte_count as u32)));
        }

        if !signed && byte_count == 8 && value > i64::MAX as u64 {
            return Err(Error::OutOfRange(format!(
                "unsigned value {:#018x} exceeds exact integer range",
                value
            )));
        }

        Ok(value as i64)
    }

    /// [`peek`](Self::peek), then advance the cursor by `byte_count`
    pub fn read(&mut self, byte_count: usize, signed: bool) -> Result<i64> {
        let value = self.peek(byte_count, signed)?;
        self.cursor += byte_count;
        Ok(value)
    }

    /// Next `n` raw bytes verbatim
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.cursor + n > self.buf.len() {
            return Err(Error::OutOfRange(format!(
                "read of {} bytes at offset {} passes end of {}-byte buffer",
                n,
                self.cursor,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    /// Read a fixed-width C-style string field.
    ///
    /// Consumes exactly `field_width` bytes; characters are taken up to the
    /// first zero byte and the rest of the field is ignored (it is not
    /// required to be zero).
    pub fn read_string(&mut self, field_width: usize) -> Result<String> {
        let field = self.read_bytes(field_width)?;
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        Ok(String::from_utf8_lossy(&field[..end]).into_owned())
    }

    /// Move the cursor forward by `n`, clamped to the end of the buffer
    pub fn forward(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.buf.len());
    }

    /// Move the cursor back by `n`, clamped to the start of the buffer
    pub fn back(&mut self, n: usize) {
        self.cursor = self.cursor.saturating_sub(n);
    }

    // === Width-specific accessors ===

    /// Read an unsigned 8-bit value
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read(1, false)? as u8)
    }

    /// Read an unsigned 16-bit value
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read(2, false)? as u16)
    }

    /// Read an unsigned 32-bit value
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read(4, false)? as u32)
    }

    /// Read an unsigned 48-bit value
    pub fn read_u48(&mut self) -> Result<u64> {
        Ok(self.read(6, false)? as u64)
    }

    /// Read an unsigned 64-bit value (full range, no exact-integer guard)
    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(le))
    }

    /// Read a signed 8-bit value
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read(1, true)? as i8)
    }

    /// Read a signed 16-bit value
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read(2, true)? as i16)
    }

    /// Read a signed 32-bit value
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read(4, true)? as i32)
    }

    /// Read a signed 48-bit value
    pub fn read_i48(&mut self) -> Result<i64> {
        self.read(6, true)
    }

    /// Read a signed 64-bit value
    pub fn read_i64(&mut self) -> Result<i64> {
        self.read(8, true)
    }
}

/// Mirror writer accumulating little-endian fields into a growable buffer
#[derive(Default)]
pub struct BytesWriter {
    buf: Vec<u8>,
}

impl BytesWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Create a writer with pre-allocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// View the accumulated bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer, returning the accumulated bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Append raw bytes verbatim
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append the low `byte_count` bytes of `value`, little-endian
    pub fn write(&mut self, value: u64, byte_count: usize) {
        for i in 0..byte_count {
            self.buf.push((value >> (8 * i)) as u8);
        }
    }

    /// Append a fixed-width string field, NUL-padded to `field_width`.
    /// Longer strings are truncated to leave room for the terminator.
    pub fn write_string(&mut self, s: &str, field_width: usize) {
        let bytes = s.as_bytes();
        let take = bytes.len().min(field_width.saturating_sub(1));
        self.buf.extend_from_slice(&bytes[..take]);
        for _ in take..field_width {
            self.buf.push(0);
        }
    }

    // === Width-specific accessors ===

    /// Append an unsigned 8-bit value
    pub fn write_u8(&mut self, value: u8) {
        self.write(value as u64, 1);
    }

    /// Append an unsigned 16-bit value
    pub fn write_u16(&mut self, value: u16) {
        self.write(value as u64, 2);
    }

    /// Append an unsigned 32-bit value
    pub fn write_u32(&mut self, value: u32) {
        self.write(value as u64, 4);
    }

    /// Append an unsigned 48-bit value (low 6 bytes of `value`)
    pub fn write_u48(&mut self, value: u64) {
        self.write(value, 6);
    }

    /// Append an unsigned 64-bit value
    pub fn write_u64(&mut self, value: u64) {
        self.write(value, 8);
    }

    /// Append a signed 8-bit value
    pub fn write_i8(&mut self, value: i8) {
        self.write(value as u8 as u64, 1);
    }

    /// Append a signed 16-bit value
    pub fn write_i16(&mut self, value: i16) {
        self.write(value as u16 as u64, 2);
    }

    /// Append a signed 32-bit value
    pub fn write_i32(&mut self, value: i32) {
        self.write(value as u32 as u64, 4);
    }

    /// Append a signed 48-bit value (low 6 bytes of the two's complement)
    pub fn write_i48(&mut self, value: i64) {
        self.write(value as u64, 6);
    }

    /// Append a signed 64-bit value
    pub fn write_i64(&mut self, value: i64) {
        self.write(value as u64, 8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_reads_are_little_endian() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        for width in 1..=8usize {
            let mut expected: i64 = 0;
            for i in 0..width.min(8) {
                expected |= (buf[i] as i64) << (8 * i);
            }
            // Width 8 of this pattern stays within i64
            let mut r = BytesReader::new(&buf);
            assert_eq!(r.read(width, false).unwrap(), expected, "width {}", width);
            assert_eq!(r.position(), width);
        }
    }

    #[test]
    fn signed_read_uses_twos_complement() {
        let mut r = BytesReader::new(&[0xFF]);
        assert_eq!(r.read(1, true).unwrap(), -1);

        let mut r = BytesReader::new(&[0xFE, 0xFF]);
        assert_eq!(r.read(2, true).unwrap(), -2);

        let mut r = BytesReader::new(&[0x00, 0x80]);
        assert_eq!(r.read(2, true).unwrap(), -32768);

        // Top bit clear stays positive
        let mut r = BytesReader::new(&[0xFF, 0x7F]);
        assert_eq!(r.read(2, true).unwrap(), 32767);
    }

    #[test]
    fn peek_does_not_advance() {
        let r = BytesReader::new(&[0x34, 0x12]);
        assert_eq!(r.peek(2, false).unwrap(), 0x1234);
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn read_past_end_fails() {
        let mut r = BytesReader::new(&[0x01, 0x02]);
        assert!(matches!(r.read(3, false), Err(Error::OutOfRange(_))));
        assert!(matches!(r.peek(9, false), Err(Error::OutOfRange(_))));
        r.read(2, false).unwrap();
        assert!(matches!(r.read(1, false), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn unsigned_u64_above_exact_range_fails_via_read() {
        let buf = [0xFF; 8];
        let mut r = BytesReader::new(&buf);
        assert!(matches!(r.read(8, false), Err(Error::OutOfRange(_))));

        // The dedicated accessor keeps the full range
        let mut r = BytesReader::new(&buf);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
    }

    #[test]
    fn read_string_stops_at_nul_and_consumes_field() {
        let mut field = Vec::from(&b"ABC\0"[..]);
        field.extend_from_slice(&[0xAA; 12]);
        assert_eq!(field.len(), 16);

        let mut r = BytesReader::new(&field);
        assert_eq!(r.read_string(16).unwrap(), "ABC");
        assert_eq!(r.position(), 16);
    }

    #[test]
    fn read_string_without_terminator_takes_whole_field() {
        let mut r = BytesReader::new(b"ABCD");
        assert_eq!(r.read_string(4).unwrap(), "ABCD");
    }

    #[test]
    fn forward_and_back_clamp_to_bounds() {
        let mut r = BytesReader::new(&[0u8; 4]);
        r.forward(100);
        assert_eq!(r.position(), 4);
        r.back(1);
        assert_eq!(r.position(), 3);
        r.back(100);
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn writer_reader_round_trip_all_widths() {
        let mut w = BytesWriter::new();
        w.write(0xAB, 1);
        w.write(0xBEEF, 2);
        w.write(0x00C0FFEE, 3);
        w.write(0xDEADBEEF, 4);
        w.write(0x0000_1234_5678_9ABC, 6);
        w.write(0x0123_4567_89AB_CDEF, 8);

        let bytes = w.into_bytes();
        let mut r = BytesReader::new(&bytes);
        assert_eq!(r.read(1, false).unwrap(), 0xAB);
        assert_eq!(r.read(2, false).unwrap(), 0xBEEF);
        assert_eq!(r.read(3, false).unwrap(), 0x00C0FFEE);
        assert_eq!(r.read(4, false).unwrap(), 0xDEADBEEF);
        assert_eq!(r.read(6, false).unwrap(), 0x0000_1234_5678_9ABC);
        assert_eq!(r.read(8, false).unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn signed_round_trip() {
        let mut w = BytesWriter::new();
        w.write_i8(-5);
        w.write_i16(-1234);
        w.write_i32(-123_456);
        w.write_i48(-(1i64 << 40));
        w.write_i64(i64::MIN);

        let bytes = w.into_bytes();
        let mut r = BytesReader::new(&bytes);
        assert_eq!(r.read_i8().unwrap(), -5);
        assert_eq!(r.read_i16().unwrap(), -1234);
        assert_eq!(r.read_i32().unwrap(), -123_456);
        assert_eq!(r.read_i48().unwrap(), -(1i64 << 40));
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
    }

    #[test]
    fn string_round_trip_pads_with_nul() {
        let mut w = BytesWriter::new();
        w.write_string("lamp-7", 16);
        assert_eq!(w.len(), 16);

        let bytes = w.into_bytes();
        let mut r = BytesReader::new(&bytes);
        assert_eq!(r.read_string(16).unwrap(), "lamp-7");
    }

    #[test]
    fn read_bytes_returns_verbatim_slice() {
        let mut r = BytesReader::new(&[1, 2, 3, 4, 5]);
        assert_eq!(r.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(r.remaining(), 2);
        assert!(matches!(r.read_bytes(3), Err(Error::OutOfRange(_))));
    }
}
