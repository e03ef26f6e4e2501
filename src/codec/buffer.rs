//! Byte cursor used by every codec.
//!
//! A `CodecBuffer` is either writable (growing from position 0) or readable
//! (bounded by a fixed limit). `flip()` moves a written buffer into read mode
//! and `clear()` returns any buffer to an empty writable state so the same
//! allocation can be reused across encode passes.
//!
//! Wire conventions:
//! - fixed-width integers are little-endian
//! - `varint`/`varlong` are unsigned LEB128 (low 7 bits first) and are used
//!   for counts and lengths
//! - the `signed_` variants apply zig-zag on top of LEB128
//! - strings are a varint byte length followed by UTF-8 bytes

use super::{CodecError, CodecResult};

/// Longest LEB128 encoding of a u32.
const MAX_VARINT_LEN: usize = 5;

/// Longest LEB128 encoding of a u64.
const MAX_VARLONG_LEN: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Write,
    Read { limit: usize },
}

/// A mutable byte cursor, exclusively writable or readable at any moment.
#[derive(Clone, Debug)]
pub struct CodecBuffer {
    data: Vec<u8>,
    position: usize,
    mode: Mode,
}

impl CodecBuffer {
    /// Creates an empty writable buffer.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty writable buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            position: 0,
            mode: Mode::Write,
        }
    }

    /// Wraps existing bytes in a readable buffer positioned at 0.
    pub fn wrap(data: Vec<u8>) -> Self {
        let limit = data.len();
        Self {
            data,
            position: 0,
            mode: Mode::Read { limit },
        }
    }

    /// Copies `data` into a new readable buffer.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::wrap(data.to_vec())
    }

    pub fn is_writable(&self) -> bool {
        self.mode == Mode::Write
    }

    pub fn is_readable(&self) -> bool {
        matches!(self.mode, Mode::Read { .. })
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes written so far (writable) or the fixed readable size.
    pub fn size(&self) -> usize {
        match self.mode {
            Mode::Write => self.data.len(),
            Mode::Read { limit } => limit,
        }
    }

    /// Bytes left to read. Always 0 for a writable buffer.
    pub fn remaining(&self) -> usize {
        match self.mode {
            Mode::Write => 0,
            Mode::Read { limit } => limit - self.position,
        }
    }

    /// Switches a writable buffer to read mode over the bytes written.
    pub fn flip(&mut self) -> CodecResult<()> {
        self.ensure_writable("flip")?;
        self.mode = Mode::Read {
            limit: self.data.len(),
        };
        self.position = 0;
        Ok(())
    }

    /// Resets the buffer to an empty writable state, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
        self.position = 0;
        self.mode = Mode::Write;
    }

    /// The readable bytes between the cursor and the limit.
    pub fn as_slice(&self) -> CodecResult<&[u8]> {
        match self.mode {
            Mode::Read { limit } => Ok(&self.data[self.position..limit]),
            Mode::Write => Err(CodecError::UnsupportedOperation("as_slice on writable buffer")),
        }
    }

    /// Everything written so far, regardless of mode.
    pub fn written(&self) -> &[u8] {
        match self.mode {
            Mode::Write => &self.data,
            Mode::Read { limit } => &self.data[..limit],
        }
    }

    /// Consumes the buffer and returns its bytes.
    pub fn into_bytes(mut self) -> Vec<u8> {
        if let Mode::Read { limit } = self.mode {
            self.data.truncate(limit);
        }
        self.data
    }

    /// Ensures at least `additional` more bytes can be written without reallocating.
    pub fn reserve(&mut self, additional: usize) -> CodecResult<()> {
        self.ensure_writable("reserve")?;
        self.data.reserve(additional);
        Ok(())
    }

    // --- fixed width ---

    pub fn write_u8(&mut self, value: u8) -> CodecResult<()> {
        self.ensure_writable("write_u8")?;
        self.data.push(value);
        self.position += 1;
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> CodecResult<()> {
        self.write_u8(value as u8)
    }

    pub fn write_i32(&mut self, value: i32) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes(), "write_i32")
    }

    pub fn write_i64(&mut self, value: i64) -> CodecResult<()> {
        self.write_raw(&value.to_le_bytes(), "write_i64")
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        let bytes = self.take(1, "read_u8")?;
        Ok(bytes[0])
    }

    pub fn read_i8(&mut self) -> CodecResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i32(&mut self) -> CodecResult<i32> {
        let bytes = self.take(4, "read_i32")?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(i32::from_le_bytes(raw))
    }

    pub fn read_i64(&mut self) -> CodecResult<i64> {
        let bytes = self.take(8, "read_i64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    // --- variable length ---

    pub fn write_varint(&mut self, value: u32) -> CodecResult<()> {
        self.write_varlong(u64::from(value))
    }

    pub fn write_varlong(&mut self, mut value: u64) -> CodecResult<()> {
        self.ensure_writable("write_varlong")?;
        let mut scratch = [0u8; MAX_VARLONG_LEN];
        let mut len = 0;
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                scratch[len] = byte;
                len += 1;
                break;
            }
            scratch[len] = byte | 0x80;
            len += 1;
        }
        self.write_raw(&scratch[..len], "write_varlong")
    }

    pub fn read_varint(&mut self) -> CodecResult<u32> {
        let value = self.read_leb128(MAX_VARINT_LEN, "read_varint")?;
        u32::try_from(value)
            .map_err(|_| CodecError::InvalidData(format!("varint {} overflows u32", value)))
    }

    pub fn read_varlong(&mut self) -> CodecResult<u64> {
        self.read_leb128(MAX_VARLONG_LEN, "read_varlong")
    }

    pub fn write_signed_varint(&mut self, value: i32) -> CodecResult<()> {
        self.write_varint(((value << 1) ^ (value >> 31)) as u32)
    }

    pub fn read_signed_varint(&mut self) -> CodecResult<i32> {
        let raw = self.read_varint()?;
        Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
    }

    pub fn write_signed_varlong(&mut self, value: i64) -> CodecResult<()> {
        self.write_varlong(((value << 1) ^ (value >> 63)) as u64)
    }

    pub fn read_signed_varlong(&mut self) -> CodecResult<i64> {
        let raw = self.read_varlong()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    /// Reads a varint count or length as `usize`.
    pub fn read_len(&mut self) -> CodecResult<usize> {
        Ok(self.read_varint()? as usize)
    }

    // --- raw bytes ---

    pub fn write_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.write_raw(bytes, "write_bytes")
    }

    pub fn read_bytes(&mut self, len: usize) -> CodecResult<Vec<u8>> {
        Ok(self.take(len, "read_bytes")?.to_vec())
    }

    pub fn read_bytes_into(&mut self, dst: &mut [u8]) -> CodecResult<()> {
        let bytes = self.take(dst.len(), "read_bytes_into")?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// Appends the unread region of `src`, leaving `src` untouched.
    pub fn write_buffer(&mut self, src: &CodecBuffer) -> CodecResult<()> {
        let bytes = src.as_slice()?;
        self.write_raw(bytes, "write_buffer")
    }

    /// Splits the next `len` bytes off into their own readable buffer.
    pub fn read_buffer(&mut self, len: usize) -> CodecResult<CodecBuffer> {
        Ok(CodecBuffer::from_slice(self.take(len, "read_buffer")?))
    }

    // --- bulk numeric arrays ---

    pub fn write_i32_slice(&mut self, values: &[i32]) -> CodecResult<()> {
        self.ensure_writable("write_i32_slice")?;
        self.data.reserve(values.len() * 4);
        for value in values {
            self.data.extend_from_slice(&value.to_le_bytes());
        }
        self.position = self.data.len();
        Ok(())
    }

    pub fn read_i32_vec(&mut self, count: usize) -> CodecResult<Vec<i32>> {
        let byte_len = count
            .checked_mul(4)
            .ok_or_else(|| CodecError::InvalidData(format!("int array of {} elements", count)))?;
        let bytes = self.take(byte_len, "read_i32_vec")?;
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    pub fn write_i64_slice(&mut self, values: &[i64]) -> CodecResult<()> {
        self.ensure_writable("write_i64_slice")?;
        self.data.reserve(values.len() * 8);
        for value in values {
            self.data.extend_from_slice(&value.to_le_bytes());
        }
        self.position = self.data.len();
        Ok(())
    }

    pub fn read_i64_vec(&mut self, count: usize) -> CodecResult<Vec<i64>> {
        let byte_len = count
            .checked_mul(8)
            .ok_or_else(|| CodecError::InvalidData(format!("long array of {} elements", count)))?;
        let bytes = self.take(byte_len, "read_i64_vec")?;
        Ok(bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                i64::from_le_bytes(raw)
            })
            .collect())
    }

    // --- helpers ---

    pub fn write_string(&mut self, value: &str) -> CodecResult<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| CodecError::InvalidData(format!("string of {} bytes", value.len())))?;
        self.write_varint(len)?;
        if len == 0 {
            return Ok(());
        }
        self.write_bytes(value.as_bytes())
    }

    pub fn read_string(&mut self) -> CodecResult<String> {
        let len = self.read_len()?;
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| CodecError::InvalidData(e.to_string()))
    }

    pub fn write_bool(&mut self, value: bool) -> CodecResult<()> {
        self.write_u8(u8::from(value))
    }

    pub fn read_bool(&mut self) -> CodecResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn ensure_writable(&self, op: &'static str) -> CodecResult<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(CodecError::UnsupportedOperation(op))
        }
    }

    fn write_raw(&mut self, bytes: &[u8], op: &'static str) -> CodecResult<()> {
        self.ensure_writable(op)?;
        self.data.extend_from_slice(bytes);
        self.position = self.data.len();
        Ok(())
    }

    fn take(&mut self, len: usize, op: &'static str) -> CodecResult<&[u8]> {
        let limit = match self.mode {
            Mode::Read { limit } => limit,
            Mode::Write => return Err(CodecError::UnsupportedOperation(op)),
        };
        let remaining = limit - self.position;
        if len > remaining {
            return Err(CodecError::Underflow {
                needed: len,
                remaining,
            });
        }
        let start = self.position;
        self.position += len;
        Ok(&self.data[start..start + len])
    }

    fn read_leb128(&mut self, max_len: usize, op: &'static str) -> CodecResult<u64> {
        let mut result = 0u64;
        for i in 0..max_len {
            let byte = self.take(1, op)?[0];
            result |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(CodecError::InvalidData(format!(
            "varint longer than {} bytes",
            max_len
        )))
    }
}

impl Default for CodecBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flipped(write: impl FnOnce(&mut CodecBuffer) -> CodecResult<()>) -> CodecBuffer {
        let mut buf = CodecBuffer::new();
        write(&mut buf).unwrap();
        buf.flip().unwrap();
        buf
    }

    #[test]
    fn test_fixed_width_little_endian() {
        let buf = flipped(|b| {
            b.write_i32(0x0102_0304)?;
            b.write_i64(-2)
        });
        assert_eq!(&buf.written()[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(buf.size(), 12);

        let mut buf = buf;
        assert_eq!(buf.read_i32().unwrap(), 0x0102_0304);
        assert_eq!(buf.read_i64().unwrap(), -2);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_varint_encoding() {
        let buf = flipped(|b| {
            b.write_varint(0)?;
            b.write_varint(127)?;
            b.write_varint(128)?;
            b.write_varlong(u64::MAX)
        });
        // 1 + 1 + 2 + 10
        assert_eq!(buf.size(), 14);
        assert_eq!(&buf.written()[2..4], &[0x80, 0x01]);

        let mut buf = buf;
        assert_eq!(buf.read_varint().unwrap(), 0);
        assert_eq!(buf.read_varint().unwrap(), 127);
        assert_eq!(buf.read_varint().unwrap(), 128);
        assert_eq!(buf.read_varlong().unwrap(), u64::MAX);
    }

    #[test]
    fn test_zigzag() {
        let mut buf = flipped(|b| {
            b.write_signed_varint(-1)?;
            b.write_signed_varint(i32::MIN)?;
            b.write_signed_varlong(i64::MAX)
        });
        assert_eq!(buf.written()[0], 0x01);
        assert_eq!(buf.read_signed_varint().unwrap(), -1);
        assert_eq!(buf.read_signed_varint().unwrap(), i32::MIN);
        assert_eq!(buf.read_signed_varlong().unwrap(), i64::MAX);
    }

    #[test]
    fn test_varint_overflowing_u32_rejected() {
        let mut buf = flipped(|b| b.write_varlong(u64::from(u32::MAX) + 1));
        assert!(matches!(buf.read_varint(), Err(CodecError::InvalidData(_))));
    }

    #[test]
    fn test_empty_string_is_single_zero_byte() {
        let mut buf = flipped(|b| b.write_string(""));
        assert_eq!(buf.written(), &[0]);
        assert_eq!(buf.read_string().unwrap(), "");
    }

    #[test]
    fn test_string_and_bool() {
        let mut buf = flipped(|b| {
            b.write_string("//pkg:target")?;
            b.write_bool(true)?;
            b.write_bool(false)
        });
        assert_eq!(buf.read_string().unwrap(), "//pkg:target");
        assert!(buf.read_bool().unwrap());
        assert!(!buf.read_bool().unwrap());
    }

    #[test]
    fn test_read_on_writable_is_unsupported() {
        let mut buf = CodecBuffer::new();
        buf.write_i32(1).unwrap();
        assert!(matches!(
            buf.read_i32(),
            Err(CodecError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_write_on_readable_is_unsupported() {
        let mut buf = CodecBuffer::from_slice(&[1, 2, 3]);
        assert!(matches!(
            buf.write_u8(4),
            Err(CodecError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            buf.reserve(16),
            Err(CodecError::UnsupportedOperation(_))
        ));
        assert!(matches!(buf.flip(), Err(CodecError::UnsupportedOperation(_))));
    }

    #[test]
    fn test_underflow() {
        let mut buf = CodecBuffer::from_slice(&[1, 2]);
        assert!(matches!(
            buf.read_i32(),
            Err(CodecError::Underflow {
                needed: 4,
                remaining: 2
            })
        ));
    }

    #[test]
    fn test_clear_reuses_buffer() {
        let mut buf = flipped(|b| b.write_i64(42));
        buf.clear();
        assert!(buf.is_writable());
        assert_eq!(buf.size(), 0);
        buf.write_u8(7).unwrap();
        buf.flip().unwrap();
        assert_eq!(buf.read_u8().unwrap(), 7);
    }

    #[test]
    fn test_bulk_arrays_preserve_order() {
        let ints = vec![5, -3, i32::MAX, 0];
        let longs = vec![i64::MIN, 9, 1 << 40];
        let mut buf = flipped(|b| {
            b.write_i32_slice(&ints)?;
            b.write_i64_slice(&longs)
        });
        assert_eq!(buf.read_i32_vec(ints.len()).unwrap(), ints);
        assert_eq!(buf.read_i64_vec(longs.len()).unwrap(), longs);
    }

    #[test]
    fn test_buffer_transfer() {
        let src = flipped(|b| b.write_bytes(b"abcdef"));
        let mut dst = CodecBuffer::new();
        dst.write_buffer(&src).unwrap();
        dst.flip().unwrap();

        let mut head = dst.read_buffer(2).unwrap();
        assert_eq!(head.read_bytes(2).unwrap(), b"ab");
        let mut rest = [0u8; 4];
        dst.read_bytes_into(&mut rest).unwrap();
        assert_eq!(&rest, b"cdef");
    }
}
