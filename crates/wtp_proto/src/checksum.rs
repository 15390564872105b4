//! See [`ChecksumStream`].

use bytes::Bytes;

use crate::error::WtpError;

/// Checksum function over a byte slice, producing the single-byte checksum
/// that follows every WTP packet on the wire.
pub type ChecksumFn = fn(&[u8]) -> u8;

/// Byte-wise XOR checksum, the function used by the WISP air interface.
#[must_use]
pub fn xor_checksum(buf: &[u8]) -> u8 {
    buf.iter().fold(0, |acc, b| acc ^ b)
}

/// Little-endian byte cursor with checksum spans.
///
/// WTP frames every packet with a one-byte checksum covering exactly that
/// packet's bytes, type byte included. The stream tracks the span with
/// [`begin_checksum`]: everything written (or read) between the most recent
/// `begin_checksum` call and the current cursor is covered. On the write
/// path [`write_checksum`] appends the checksum; on the read path
/// [`validate_checksum`] consumes the next stream byte and compares.
///
/// The checksum function is pluggable via [`with_checksum_fn`]; the default
/// is [`xor_checksum`].
///
/// [`begin_checksum`]: ChecksumStream::begin_checksum
/// [`write_checksum`]: ChecksumStream::write_checksum
/// [`validate_checksum`]: ChecksumStream::validate_checksum
/// [`with_checksum_fn`]: ChecksumStream::with_checksum_fn
#[derive(Debug)]
pub struct ChecksumStream {
    buf: Vec<u8>,
    pos: usize,
    begin_pos: usize,
    checksum_fn: ChecksumFn,
}

impl Default for ChecksumStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumStream {
    /// Creates an empty stream for writing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            begin_pos: 0,
            checksum_fn: xor_checksum,
        }
    }

    /// Creates a stream over existing bytes, cursor at the start.
    #[must_use]
    pub fn from_bytes(buf: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: buf.into(),
            pos: 0,
            begin_pos: 0,
            checksum_fn: xor_checksum,
        }
    }

    /// Replaces the checksum function.
    #[must_use]
    pub fn with_checksum_fn(mut self, checksum_fn: ChecksumFn) -> Self {
        self.checksum_fn = checksum_fn;
        self
    }

    /// Current cursor position.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Total number of bytes in the stream.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the stream holds no bytes at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of bytes between the cursor and the end of the stream.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Writes raw bytes at the cursor, extending the stream as needed.
    pub fn write(&mut self, data: &[u8]) {
        if self.pos == self.buf.len() {
            self.buf.extend_from_slice(data);
        } else {
            let overlap = (self.buf.len() - self.pos).min(data.len());
            self.buf[self.pos..self.pos + overlap].copy_from_slice(&data[..overlap]);
            self.buf.extend_from_slice(&data[overlap..]);
        }
        self.pos += data.len();
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.write(&[value]);
    }

    /// Writes a little-endian 16-bit integer.
    pub fn write_u16(&mut self, value: u16) {
        self.write(&value.to_le_bytes());
    }

    /// Reads `n` bytes, or [`None`] if fewer remain. Nothing is consumed on
    /// a short read.
    pub fn read(&mut self, n: usize) -> Option<Bytes> {
        if self.remaining() < n {
            return None;
        }
        let out = Bytes::copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Some(out)
    }

    /// Reads a single byte, or [`None`] at the end of the stream.
    pub fn read_u8(&mut self) -> Option<u8> {
        let out = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(out)
    }

    /// Reads a little-endian 16-bit integer, or [`None`] if fewer than two
    /// bytes remain.
    pub fn read_u16(&mut self) -> Option<u16> {
        let bytes = [*self.buf.get(self.pos)?, *self.buf.get(self.pos + 1)?];
        self.pos += 2;
        Some(u16::from_le_bytes(bytes))
    }

    /// Starts a new checksum span at the cursor.
    pub fn begin_checksum(&mut self) {
        self.begin_pos = self.pos;
    }

    /// Appends the checksum of the current span.
    pub fn write_checksum(&mut self) {
        let checksum = (self.checksum_fn)(&self.buf[self.begin_pos..self.pos]);
        self.write_u8(checksum);
    }

    /// Consumes the next stream byte and compares it against the checksum
    /// of the current span.
    ///
    /// # Errors
    ///
    /// [`WtpError::InvalidChecksum`] on mismatch, or if the stream ends
    /// before the checksum byte.
    pub fn validate_checksum(&mut self) -> Result<(), WtpError> {
        let calc = (self.checksum_fn)(&self.buf[self.begin_pos..self.pos]);
        match self.read_u8() {
            Some(read) if read == calc => Ok(()),
            _ => Err(WtpError::InvalidChecksum),
        }
    }

    /// Consumes the stream, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}
