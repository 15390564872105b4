//! WTP wire codec.
//!
//! A packet stream - the tail of an EPC report or the payload of a Read
//! result - is a concatenation of variable-length packets, each followed by
//! a one-byte checksum over that packet's bytes. A zero type byte
//! terminates the stream and pads the unused tail.

use bytes::Bytes;
use tracing::trace;

use crate::{checksum::ChecksumStream, error::WtpError, seq::Seq};

/// No more packets; terminates a packet stream.
pub const PKT_END: u8 = 0x00;
/// Open a WTP connection.
pub const PKT_OPEN: u8 = 0x01;
/// Close a WTP connection.
pub const PKT_CLOSE: u8 = 0x02;
/// Acknowledgement carrying the receiver's next in-order sequence number.
pub const PKT_ACK: u8 = 0x03;
/// First fragment of a message, declaring the message size.
pub const PKT_BEGIN_MSG: u8 = 0x04;
/// Continuation fragment of a message.
pub const PKT_CONT_MSG: u8 = 0x05;
/// Request for uplink Read OpSpecs.
pub const PKT_REQ_UPLINK: u8 = 0x06;
/// Set a peer parameter.
pub const PKT_SET_PARAM: u8 = 0x07;

/// `SET_PARAM` code for the receive window size (16-bit value).
pub const PARAM_WINDOW_SIZE: u8 = 0x00;
/// `SET_PARAM` code for the Read OpSpec size (8-bit value).
pub const PARAM_READ_SIZE: u8 = 0x01;

/// Width of the trailing checksum after every packet.
pub const CHECKSUM_LEN: usize = 1;

/// A decoded WTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Open the connection.
    Open,
    /// Close the sender's half-link.
    Close,
    /// Acknowledge every byte before `seq`.
    Ack {
        /// The receiver's next in-order sequence number.
        seq: Seq,
    },
    /// First fragment of a message.
    BeginMsg {
        /// Total size of the message this fragment begins.
        msg_size: u16,
        /// Sequence number of the first payload byte.
        seq: Seq,
        /// Fragment payload.
        payload: Bytes,
    },
    /// Continuation fragment of a message.
    ContMsg {
        /// Sequence number of the first payload byte.
        seq: Seq,
        /// Fragment payload.
        payload: Bytes,
    },
    /// The tag requests `n_reads` Read OpSpecs of `read_size` bytes each.
    ReqUplink {
        /// Number of Read OpSpecs requested.
        n_reads: u8,
        /// Requested size of each Read OpSpec in bytes.
        read_size: u8,
    },
    /// Set a connection parameter.
    SetParam {
        /// The parameter and its new value.
        param: Param,
    },
}

/// A `SET_PARAM` payload. The value width depends on the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// New receive window size of the sender, in bytes.
    WindowSize(u16),
    /// New Read OpSpec size, in bytes. Only meaningful toward the tag.
    ReadSize(u8),
}

impl Packet {
    /// Reads the next packet from a stream, validating its checksum.
    ///
    /// Returns [`None`] at a clean end of stream (an [`PKT_END`] byte or
    /// EOF at a packet boundary) and on mid-packet truncation; truncated
    /// packets are indistinguishable from padding on this wire and are
    /// recovered by retransmission.
    ///
    /// # Errors
    ///
    /// [`WtpError::InvalidChecksum`] if the trailing checksum does not
    /// match, [`WtpError::UnsupportedOp`] on an unknown packet type or
    /// `SET_PARAM` code (the value width of an unknown code is unknowable,
    /// so the stream cannot be resynchronized).
    pub fn read_from(stream: &mut ChecksumStream) -> Result<Option<Self>, WtpError> {
        stream.begin_checksum();
        let packet_type = match stream.read_u8() {
            None | Some(PKT_END) => return Ok(None),
            Some(packet_type) => packet_type,
        };
        macro_rules! field {
            ($read:expr) => {
                match $read {
                    Some(value) => value,
                    None => {
                        trace!(packet_type, "truncated packet, dropping stream tail");
                        return Ok(None);
                    }
                }
            };
        }
        let packet = match packet_type {
            PKT_OPEN => Self::Open,
            PKT_CLOSE => Self::Close,
            PKT_ACK => Self::Ack {
                seq: Seq(field!(stream.read_u16())),
            },
            PKT_BEGIN_MSG => {
                let msg_size = field!(stream.read_u16());
                let seq = Seq(field!(stream.read_u16()));
                let payload_len = field!(stream.read_u8());
                let payload = field!(stream.read(usize::from(payload_len)));
                Self::BeginMsg {
                    msg_size,
                    seq,
                    payload,
                }
            }
            PKT_CONT_MSG => {
                let seq = Seq(field!(stream.read_u16()));
                let payload_len = field!(stream.read_u8());
                let payload = field!(stream.read(usize::from(payload_len)));
                Self::ContMsg { seq, payload }
            }
            PKT_REQ_UPLINK => Self::ReqUplink {
                n_reads: field!(stream.read_u8()),
                read_size: field!(stream.read_u8()),
            },
            PKT_SET_PARAM => {
                let param = match field!(stream.read_u8()) {
                    PARAM_WINDOW_SIZE => Param::WindowSize(field!(stream.read_u16())),
                    PARAM_READ_SIZE => Param::ReadSize(field!(stream.read_u8())),
                    code => {
                        trace!(code, "unknown SET_PARAM code");
                        return Err(WtpError::UnsupportedOp);
                    }
                };
                Self::SetParam { param }
            }
            _ => {
                trace!(packet_type, "unknown packet type");
                return Err(WtpError::UnsupportedOp);
            }
        };
        stream.validate_checksum()?;
        Ok(Some(packet))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn stream_of(packets: &[&[u8]]) -> ChecksumStream {
        let mut stream = ChecksumStream::new();
        for packet in packets {
            stream.begin_checksum();
            stream.write(packet);
            stream.write_checksum();
        }
        ChecksumStream::from_bytes(stream.into_bytes().to_vec())
    }

    #[test]
    fn decode_open_then_end() {
        let mut stream = stream_of(&[&[PKT_OPEN]]);
        assert_matches!(Packet::read_from(&mut stream), Ok(Some(Packet::Open)));
        assert_matches!(Packet::read_from(&mut stream), Ok(None));
    }

    #[test]
    fn decode_ack() {
        let mut stream = stream_of(&[&[PKT_ACK, 0x05, 0x00]]);
        assert_matches!(
            Packet::read_from(&mut stream),
            Ok(Some(Packet::Ack { seq: Seq(5) }))
        );
    }

    #[test]
    fn decode_begin_msg() {
        let mut stream = stream_of(&[&[PKT_BEGIN_MSG, 0x05, 0x00, 0x00, 0x00, 0x03, b'h', b'e', b'l']]);
        let packet = Packet::read_from(&mut stream).unwrap().unwrap();
        assert_eq!(
            packet,
            Packet::BeginMsg {
                msg_size: 5,
                seq: Seq(0),
                payload: Bytes::from_static(b"hel"),
            }
        );
    }

    #[test]
    fn decode_multiple_packets() {
        let mut stream = stream_of(&[&[PKT_OPEN], &[PKT_ACK, 0x00, 0x00], &[PKT_CONT_MSG, 0x03, 0x00, 0x02, b'l', b'o']]);
        assert_matches!(Packet::read_from(&mut stream), Ok(Some(Packet::Open)));
        assert_matches!(
            Packet::read_from(&mut stream),
            Ok(Some(Packet::Ack { seq: Seq(0) }))
        );
        assert_matches!(
            Packet::read_from(&mut stream),
            Ok(Some(Packet::ContMsg { seq: Seq(3), .. }))
        );
        assert_matches!(Packet::read_from(&mut stream), Ok(None));
    }

    #[test]
    fn corrupt_checksum_rejected() {
        let mut bytes = {
            let mut stream = ChecksumStream::new();
            stream.begin_checksum();
            stream.write(&[PKT_ACK, 0x05, 0x00]);
            stream.write_checksum();
            stream.into_bytes().to_vec()
        };
        bytes[1] ^= 0x01;
        let mut stream = ChecksumStream::from_bytes(bytes);
        assert_eq!(
            Packet::read_from(&mut stream),
            Err(WtpError::InvalidChecksum)
        );
    }

    #[test]
    fn truncated_packet_ends_stream() {
        // BEGIN_MSG declaring a 5-byte payload, cut off after two bytes
        let mut stream =
            ChecksumStream::from_bytes(vec![PKT_BEGIN_MSG, 0x05, 0x00, 0x00, 0x00, 0x05, b'h', b'e']);
        assert_matches!(Packet::read_from(&mut stream), Ok(None));
    }

    #[test]
    fn zero_padding_terminates() {
        let mut stream = ChecksumStream::from_bytes(vec![0x00; 10]);
        assert_matches!(Packet::read_from(&mut stream), Ok(None));
    }

    #[test]
    fn set_param_window_size() {
        let mut stream = stream_of(&[&[PKT_SET_PARAM, PARAM_WINDOW_SIZE, 0x80, 0x00]]);
        assert_matches!(
            Packet::read_from(&mut stream),
            Ok(Some(Packet::SetParam {
                param: Param::WindowSize(128)
            }))
        );
    }

    #[test]
    fn set_param_unknown_code_rejected() {
        let mut stream = stream_of(&[&[PKT_SET_PARAM, 0x7F, 0x00]]);
        assert_eq!(Packet::read_from(&mut stream), Err(WtpError::UnsupportedOp));
    }
}
