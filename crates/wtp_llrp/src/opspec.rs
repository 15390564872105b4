//! LLRP OpSpec construction for WISP access.
//!
//! Pure functions producing the LLRP parameters WTP submits: a Read OpSpec
//! against the USER bank, a BlockWrite OpSpec with the WISP's on-air
//! framing, the C1G2 target spec selecting one WISP by its EPC prefix, and
//! the stop trigger ending an AccessSpec after its first success.

use bytes::{Bytes, BytesMut};

/// EPC memory bank; holds the `{wisp_id, wisp_class}` addressing prefix.
pub const RFID_MB_EPC: u8 = 0x01;
/// USER memory bank; the bulk transport buffer.
pub const RFID_MB_USER: u8 = 0x03;
/// Class byte identifying a WISP in the EPC prefix.
pub const RFID_WISP_CLASS: u8 = 0x51;
/// Size of the EPC-96 field in bytes.
pub const RFID_EPC_SIZE: usize = 12;
/// Maximum number of OpSpecs batched into one AccessSpec.
pub const LLRP_N_OPSPECS_MAX: usize = 4;
/// Default LLRP reader port.
pub const LLRP_PORT: u16 = 5084;

/// An OpSpec inside an AccessSpec, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpSpec {
    /// Read from tag memory.
    Read(ReadOpSpec),
    /// Block-write to tag memory.
    BlockWrite(BlockWriteOpSpec),
}

impl OpSpec {
    /// The OpSpec ID, which orders results within a report.
    #[must_use]
    pub const fn opspec_id(&self) -> u16 {
        match self {
            Self::Read(read) => read.opspec_id,
            Self::BlockWrite(write) => write.opspec_id,
        }
    }
}

/// A C1G2 Read OpSpec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOpSpec {
    /// OpSpec ID within the AccessSpec.
    pub opspec_id: u16,
    /// Memory bank to read.
    pub mb: u8,
    /// Word offset to start reading at.
    pub word_ptr: u16,
    /// Access password; WISPs use none.
    pub access_password: u32,
    /// Number of 16-bit words to read.
    pub word_count: u16,
}

/// A C1G2 BlockWrite OpSpec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWriteOpSpec {
    /// OpSpec ID within the AccessSpec.
    pub opspec_id: u16,
    /// Memory bank to write.
    pub mb: u8,
    /// Word offset to start writing at.
    pub word_ptr: u16,
    /// Access password; WISPs use none.
    pub access_password: u32,
    /// Data on the air, already length-prefixed, padded and byte-swapped.
    pub write_data: Bytes,
    /// Number of 16-bit words in `write_data`.
    pub word_count: u16,
}

/// The C1G2 target spec matching one WISP's EPC prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTag {
    /// Memory bank the match runs against.
    pub mb: u8,
    /// Match (1) or non-match (0) tags satisfying the pattern.
    pub match_state: u8,
    /// Bit offset of the EPC data within the EPC bank.
    pub pointer: u16,
    /// Bit mask over the matched region.
    pub tag_mask: Bytes,
    /// Length of `tag_mask` in bits.
    pub mask_bit_count: u16,
    /// Pattern the masked bits must equal.
    pub tag_data: Bytes,
    /// Length of `tag_data` in bits.
    pub data_bit_count: u16,
}

/// AccessSpec stop trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessSpecStopTrigger {
    /// Stop trigger type; 1 stops after a number of operations.
    pub trigger_type: u8,
    /// Number of operations before the AccessSpec retires.
    pub operation_count: u16,
}

/// Builds a Read OpSpec for `data_size` bytes out of the USER bank.
///
/// An odd byte count rounds up to the next whole word.
#[must_use]
pub fn read_opspec(data_size: usize, opspec_id: u16) -> ReadOpSpec {
    #[allow(clippy::cast_possible_truncation)] // OpSpec budgets are tens of bytes
    let word_count = data_size.div_ceil(2) as u16;
    ReadOpSpec {
        opspec_id,
        mb: RFID_MB_USER,
        word_ptr: 0,
        access_password: 0,
        word_count,
    }
}

/// Builds a BlockWrite OpSpec carrying `data` into the USER bank.
///
/// On-air framing: a single length byte is prepended, the payload is padded
/// to an even length with a zero byte if necessary, then every 16-bit word
/// is byte-swapped so the tag reads it in host order.
#[must_use]
pub fn write_opspec(data: &[u8], opspec_id: u16) -> BlockWriteOpSpec {
    let mut buf = BytesMut::with_capacity(data.len() + 2);
    #[allow(clippy::cast_possible_truncation)] // payloads are bounded by the OpSpec budget
    buf.extend_from_slice(&[data.len() as u8]);
    buf.extend_from_slice(data);
    if buf.len() % 2 != 0 {
        buf.extend_from_slice(&[0]);
    }
    for i in (0..buf.len()).step_by(2) {
        buf.swap(i, i + 1);
    }
    #[allow(clippy::cast_possible_truncation)]
    let word_count = (buf.len() / 2) as u16;
    BlockWriteOpSpec {
        opspec_id,
        mb: RFID_MB_USER,
        word_ptr: 0,
        access_password: 0,
        write_data: buf.freeze(),
        word_count,
    }
}

/// Builds the target spec selecting the WISP with the given ID.
#[must_use]
pub fn wisp_target_info(wisp_id: u8) -> TargetTag {
    TargetTag {
        mb: RFID_MB_EPC,
        match_state: 1,
        pointer: 0x20,
        tag_mask: Bytes::from_static(&[0xFF, 0xFF]),
        mask_bit_count: 16,
        tag_data: Bytes::copy_from_slice(&[wisp_id, RFID_WISP_CLASS]),
        data_bit_count: 16,
    }
}

/// Builds the stop trigger retiring an AccessSpec after its first
/// successful operation.
#[must_use]
pub const fn access_stop_param() -> AccessSpecStopTrigger {
    AccessSpecStopTrigger {
        trigger_type: 1,
        operation_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_rounds_up_to_words() {
        assert_eq!(read_opspec(24, 0).word_count, 12);
        assert_eq!(read_opspec(9, 0).word_count, 5);
        assert_eq!(read_opspec(0, 0).word_count, 0);
        assert_eq!(read_opspec(24, 3).opspec_id, 3);
        assert_eq!(read_opspec(24, 0).mb, RFID_MB_USER);
    }

    #[test]
    fn write_frames_even_payload() {
        // 3 data bytes + length prefix = 4 bytes, no padding
        let opspec = write_opspec(b"\x0A\x0B\x0C", 1);
        assert_eq!(opspec.word_count, 2);
        // words are byte-swapped: [len, 0A] -> [0A, len], [0B, 0C] -> [0C, 0B]
        assert_eq!(opspec.write_data.as_ref(), &[0x0A, 0x03, 0x0C, 0x0B]);
    }

    #[test]
    fn write_pads_odd_payload() {
        let opspec = write_opspec(b"\x0A\x0B", 0);
        assert_eq!(opspec.word_count, 2);
        assert_eq!(opspec.write_data.as_ref(), &[0x0A, 0x02, 0x00, 0x0B]);
    }

    #[test]
    fn write_round_trips_through_on_air_framing() {
        let data = b"hello wisp";
        let opspec = write_opspec(data, 0);
        // undo the swap, strip the length prefix
        let mut on_air = opspec.write_data.to_vec();
        for i in (0..on_air.len()).step_by(2) {
            on_air.swap(i, i + 1);
        }
        let len = usize::from(on_air[0]);
        assert_eq!(&on_air[1..=len], data);
    }

    #[test]
    fn target_selects_wisp_prefix() {
        let target = wisp_target_info(0x07);
        assert_eq!(target.mb, RFID_MB_EPC);
        assert_eq!(target.pointer, 0x20);
        assert_eq!(target.tag_data.as_ref(), &[0x07, RFID_WISP_CLASS]);
        assert_eq!(target.mask_bit_count, 16);
        assert_eq!(target.tag_mask.as_ref(), &[0xFF, 0xFF]);
    }

    #[test]
    fn stop_after_first_success() {
        let stop = access_stop_param();
        assert_eq!(stop.trigger_type, 1);
        assert_eq!(stop.operation_count, 1);
    }
}
