use bytes::{Buf, BufMut};

use crate::frame;
use crate::primitives::cid::{ConnectionId, STATELESS_RESET_TOKEN_LEN};
use crate::primitives::varint::VarInt;
use crate::result::{require, QuicheError, QuicheResult, TransportError};

frame! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    STREAM = 0x08,
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE_TRANSPORT = 0x1c,
    CONNECTION_CLOSE_APPLICATION = 0x1d,
    HANDSHAKE_DONE = 0x1e,
}

/// The STREAM frame's low three bits (§4.2): FIN is the final byte, LEN
/// present means an explicit length follows (otherwise the frame runs to the
/// end of the packet), OFF present means an explicit offset follows
/// (otherwise the stream starts at offset 0).
const STREAM_FIN_BIT: u64 = 0x01;
const STREAM_LEN_BIT: u64 = 0x02;
const STREAM_OFF_BIT: u64 = 0x04;

/// One decoded ACK range, `[lo, hi]` inclusive, largest-first as carried on
/// the wire and as produced by `PnSet::ranges_desc`.
pub type AckRange = (u64, u64);

/// A fully typed QUIC frame (§4.2). Unlike the teacher's opcode-only
/// `FrameType`, every variant here carries the fields the frame layer and
/// connection/stream state machines actually need, so a decoded frame can be
/// applied directly without a second parse pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Padding,
    Ping,
    Ack {
        ranges: Vec<AckRange>,
        ack_delay: u64,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Vec<u8>,
    },
    NewToken {
        token: Vec<u8>,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        fin: bool,
        data: Vec<u8>,
    },
    MaxData {
        max: u64,
    },
    MaxStreamData {
        stream_id: u64,
        max: u64,
    },
    MaxStreamsBidi {
        max: u64,
    },
    MaxStreamsUni {
        max: u64,
    },
    DataBlocked {
        limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    StreamsBlockedBidi {
        limit: u64,
    },
    StreamsBlockedUni {
        limit: u64,
    },
    NewConnectionId {
        seq: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; STATELESS_RESET_TOKEN_LEN],
    },
    RetireConnectionId {
        seq: u64,
    },
    PathChallenge {
        data: [u8; 8],
    },
    PathResponse {
        data: [u8; 8],
    },
    ConnectionCloseTransport {
        error_code: u64,
        frame_type: u64,
        reason: Vec<u8>,
    },
    ConnectionCloseApplication {
        error_code: u64,
        reason: Vec<u8>,
    },
    HandshakeDone,
}

fn put_varint(buf: &mut Vec<u8>, value: u64) -> QuicheResult<()> {
    VarInt::from_u64(value)?.encode(buf);
    Ok(())
}

fn get_varint(buf: &mut &[u8]) -> QuicheResult<u64> {
    Ok(VarInt::decode(buf)?.into_inner())
}

fn get_bytes(buf: &mut &[u8], len: usize) -> QuicheResult<Vec<u8>> {
    require(buf.remaining() >= len, TransportError::FrameEncodingError, "frame: truncated")?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Converts the largest-first range list (as produced by `PnSet::ranges_desc`)
/// into the wire form: the largest-acknowledged number, the first (largest)
/// range's length below it, and the alternating gap/range-length pairs for
/// every subsequent range, per §4.2.
fn ranges_to_wire(ranges: &[AckRange]) -> QuicheResult<(u64, u64, Vec<(u64, u64)>)> {
    require(!ranges.is_empty(), TransportError::FrameEncodingError, "ack frame needs at least one range")?;
    let (lo0, largest) = ranges[0];
    let first_range = largest - lo0;
    let mut gaps = Vec::with_capacity(ranges.len() - 1);
    let mut prev_lo = lo0;
    for &(lo, hi) in &ranges[1..] {
        require(hi + 1 < prev_lo, TransportError::FrameEncodingError, "ack ranges must be disjoint and descending")?;
        let gap = prev_lo - hi - 2;
        let range_len = hi - lo;
        gaps.push((gap, range_len));
        prev_lo = lo;
    }
    Ok((largest, first_range, gaps))
}

/// Inverse of `ranges_to_wire`: reconstructs the largest-first range list from
/// the wire fields.
fn wire_to_ranges(largest: u64, first_range: u64, gaps: &[(u64, u64)]) -> QuicheResult<Vec<AckRange>> {
    require(first_range <= largest, TransportError::FrameEncodingError, "ack first range exceeds largest")?;
    let mut ranges = vec![(largest - first_range, largest)];
    let mut prev_lo = largest - first_range;
    for &(gap, range_len) in gaps {
        require(prev_lo >= gap + 2, TransportError::FrameEncodingError, "ack gap underflows packet number space")?;
        let hi = prev_lo - gap - 2;
        require(range_len <= hi, TransportError::FrameEncodingError, "ack range length underflows")?;
        let lo = hi - range_len;
        ranges.push((lo, hi));
        prev_lo = lo;
    }
    Ok(ranges)
}

impl Frame {
    pub fn type_code(&self) -> u64 {
        match self {
            Frame::Padding => FrameType::PADDING,
            Frame::Ping => FrameType::PING,
            Frame::Ack { .. } => FrameType::ACK,
            Frame::ResetStream { .. } => FrameType::RESET_STREAM,
            Frame::StopSending { .. } => FrameType::STOP_SENDING,
            Frame::Crypto { .. } => FrameType::CRYPTO,
            Frame::NewToken { .. } => FrameType::NEW_TOKEN,
            Frame::Stream { .. } => FrameType::STREAM,
            Frame::MaxData { .. } => FrameType::MAX_DATA,
            Frame::MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            Frame::MaxStreamsBidi { .. } => FrameType::MAX_STREAMS_BIDI,
            Frame::MaxStreamsUni { .. } => FrameType::MAX_STREAMS_UNI,
            Frame::DataBlocked { .. } => FrameType::DATA_BLOCKED,
            Frame::StreamDataBlocked { .. } => FrameType::STREAM_DATA_BLOCKED,
            Frame::StreamsBlockedBidi { .. } => FrameType::STREAMS_BLOCKED_BIDI,
            Frame::StreamsBlockedUni { .. } => FrameType::STREAMS_BLOCKED_UNI,
            Frame::NewConnectionId { .. } => FrameType::NEW_CONNECTION_ID,
            Frame::RetireConnectionId { .. } => FrameType::RETIRE_CONNECTION_ID,
            Frame::PathChallenge { .. } => FrameType::PATH_CHALLENGE,
            Frame::PathResponse { .. } => FrameType::PATH_RESPONSE,
            Frame::ConnectionCloseTransport { .. } => FrameType::CONNECTION_CLOSE_TRANSPORT,
            Frame::ConnectionCloseApplication { .. } => FrameType::CONNECTION_CLOSE_APPLICATION,
            Frame::HandshakeDone => FrameType::HANDSHAKE_DONE,
        }
    }

    /// Whether receiving this frame should elicit an ACK (everything except
    /// PADDING and ACK itself, per RFC 9000 §13.2).
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Padding | Frame::Ack { .. })
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> QuicheResult<()> {
        match self {
            Frame::Padding => put_varint(out, FrameType::PADDING)?,
            Frame::Ping => put_varint(out, FrameType::PING)?,
            Frame::Ack { ranges, ack_delay } => {
                let (largest, first_range, gaps) = ranges_to_wire(ranges)?;
                put_varint(out, FrameType::ACK)?;
                put_varint(out, largest)?;
                put_varint(out, *ack_delay)?;
                put_varint(out, gaps.len() as u64)?;
                put_varint(out, first_range)?;
                for (gap, range_len) in gaps {
                    put_varint(out, gap)?;
                    put_varint(out, range_len)?;
                }
            }
            Frame::ResetStream { stream_id, error_code, final_size } => {
                put_varint(out, FrameType::RESET_STREAM)?;
                put_varint(out, *stream_id)?;
                put_varint(out, *error_code)?;
                put_varint(out, *final_size)?;
            }
            Frame::StopSending { stream_id, error_code } => {
                put_varint(out, FrameType::STOP_SENDING)?;
                put_varint(out, *stream_id)?;
                put_varint(out, *error_code)?;
            }
            Frame::Crypto { offset, data } => {
                put_varint(out, FrameType::CRYPTO)?;
                put_varint(out, *offset)?;
                put_varint(out, data.len() as u64)?;
                out.extend_from_slice(data);
            }
            Frame::NewToken { token } => {
                put_varint(out, FrameType::NEW_TOKEN)?;
                put_varint(out, token.len() as u64)?;
                out.extend_from_slice(token);
            }
            Frame::Stream { stream_id, offset, fin, data } => {
                // Always emit OFF and LEN explicitly: the codec always knows
                // its own length and composes packets with trailing PADDING
                // rather than truncated runs, so the implicit forms are
                // never needed on encode (still accepted on decode).
                let mut ty = FrameType::STREAM | STREAM_OFF_BIT | STREAM_LEN_BIT;
                if *fin {
                    ty |= STREAM_FIN_BIT;
                }
                put_varint(out, ty)?;
                put_varint(out, *stream_id)?;
                put_varint(out, *offset)?;
                put_varint(out, data.len() as u64)?;
                out.extend_from_slice(data);
            }
            Frame::MaxData { max } => {
                put_varint(out, FrameType::MAX_DATA)?;
                put_varint(out, *max)?;
            }
            Frame::MaxStreamData { stream_id, max } => {
                put_varint(out, FrameType::MAX_STREAM_DATA)?;
                put_varint(out, *stream_id)?;
                put_varint(out, *max)?;
            }
            Frame::MaxStreamsBidi { max } => {
                put_varint(out, FrameType::MAX_STREAMS_BIDI)?;
                put_varint(out, *max)?;
            }
            Frame::MaxStreamsUni { max } => {
                put_varint(out, FrameType::MAX_STREAMS_UNI)?;
                put_varint(out, *max)?;
            }
            Frame::DataBlocked { limit } => {
                put_varint(out, FrameType::DATA_BLOCKED)?;
                put_varint(out, *limit)?;
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                put_varint(out, FrameType::STREAM_DATA_BLOCKED)?;
                put_varint(out, *stream_id)?;
                put_varint(out, *limit)?;
            }
            Frame::StreamsBlockedBidi { limit } => {
                put_varint(out, FrameType::STREAMS_BLOCKED_BIDI)?;
                put_varint(out, *limit)?;
            }
            Frame::StreamsBlockedUni { limit } => {
                put_varint(out, FrameType::STREAMS_BLOCKED_UNI)?;
                put_varint(out, *limit)?;
            }
            Frame::NewConnectionId { seq, retire_prior_to, cid, reset_token } => {
                put_varint(out, FrameType::NEW_CONNECTION_ID)?;
                put_varint(out, *seq)?;
                put_varint(out, *retire_prior_to)?;
                out.push(cid.len() as u8);
                out.extend_from_slice(cid.as_slice());
                out.extend_from_slice(reset_token);
            }
            Frame::RetireConnectionId { seq } => {
                put_varint(out, FrameType::RETIRE_CONNECTION_ID)?;
                put_varint(out, *seq)?;
            }
            Frame::PathChallenge { data } => {
                put_varint(out, FrameType::PATH_CHALLENGE)?;
                out.extend_from_slice(data);
            }
            Frame::PathResponse { data } => {
                put_varint(out, FrameType::PATH_RESPONSE)?;
                out.extend_from_slice(data);
            }
            Frame::ConnectionCloseTransport { error_code, frame_type, reason } => {
                put_varint(out, FrameType::CONNECTION_CLOSE_TRANSPORT)?;
                put_varint(out, *error_code)?;
                put_varint(out, *frame_type)?;
                put_varint(out, reason.len() as u64)?;
                out.extend_from_slice(reason);
            }
            Frame::ConnectionCloseApplication { error_code, reason } => {
                put_varint(out, FrameType::CONNECTION_CLOSE_APPLICATION)?;
                put_varint(out, *error_code)?;
                put_varint(out, reason.len() as u64)?;
                out.extend_from_slice(reason);
            }
            Frame::HandshakeDone => put_varint(out, FrameType::HANDSHAKE_DONE)?,
        }
        Ok(())
    }

    /// Decodes one frame from the front of `buf`, which must hold exactly the
    /// remaining bytes of one packet's payload (so a length-less STREAM/CRYPTO
    /// tail can consume "the rest of the packet" per §4.2).
    pub fn decode(buf: &mut &[u8]) -> QuicheResult<Frame> {
        let ty = get_varint(buf)?;
        match ty {
            FrameType::PADDING => Ok(Frame::Padding),
            FrameType::PING => Ok(Frame::Ping),
            FrameType::ACK | FrameType::ACK_ECN => {
                let largest = get_varint(buf)?;
                let ack_delay = get_varint(buf)?;
                let range_count = get_varint(buf)?;
                let first_range = get_varint(buf)?;
                let mut gaps = Vec::with_capacity(range_count as usize);
                for _ in 0..range_count {
                    let gap = get_varint(buf)?;
                    let range_len = get_varint(buf)?;
                    gaps.push((gap, range_len));
                }
                if ty == FrameType::ACK_ECN {
                    let _ect0 = get_varint(buf)?;
                    let _ect1 = get_varint(buf)?;
                    let _ecn_ce = get_varint(buf)?;
                }
                let ranges = wire_to_ranges(largest, first_range, &gaps)?;
                Ok(Frame::Ack { ranges, ack_delay })
            }
            FrameType::RESET_STREAM => Ok(Frame::ResetStream {
                stream_id: get_varint(buf)?,
                error_code: get_varint(buf)?,
                final_size: get_varint(buf)?,
            }),
            FrameType::STOP_SENDING => Ok(Frame::StopSending {
                stream_id: get_varint(buf)?,
                error_code: get_varint(buf)?,
            }),
            FrameType::CRYPTO => {
                let offset = get_varint(buf)?;
                let len = get_varint(buf)? as usize;
                let data = get_bytes(buf, len)?;
                Ok(Frame::Crypto { offset, data })
            }
            FrameType::NEW_TOKEN => {
                let len = get_varint(buf)? as usize;
                require(len > 0, TransportError::FrameEncodingError, "new_token must not be empty")?;
                Ok(Frame::NewToken { token: get_bytes(buf, len)? })
            }
            t if (FrameType::STREAM..=FrameType::STREAM | 0x07).contains(&t) => {
                let off = t & STREAM_OFF_BIT != 0;
                let len_present = t & STREAM_LEN_BIT != 0;
                let fin = t & STREAM_FIN_BIT != 0;
                let stream_id = get_varint(buf)?;
                let offset = if off { get_varint(buf)? } else { 0 };
                let data = if len_present {
                    let len = get_varint(buf)? as usize;
                    get_bytes(buf, len)?
                } else {
                    get_bytes(buf, buf.remaining())?
                };
                require(
                    offset.checked_add(data.len() as u64).map(|e| e < (1u64 << 62)).unwrap_or(false),
                    TransportError::FrameEncodingError,
                    "stream offset + length exceeds 2^62-1",
                )?;
                Ok(Frame::Stream { stream_id, offset, fin, data })
            }
            FrameType::MAX_DATA => Ok(Frame::MaxData { max: get_varint(buf)? }),
            FrameType::MAX_STREAM_DATA => Ok(Frame::MaxStreamData {
                stream_id: get_varint(buf)?,
                max: get_varint(buf)?,
            }),
            FrameType::MAX_STREAMS_BIDI => Ok(Frame::MaxStreamsBidi { max: get_varint(buf)? }),
            FrameType::MAX_STREAMS_UNI => Ok(Frame::MaxStreamsUni { max: get_varint(buf)? }),
            FrameType::DATA_BLOCKED => Ok(Frame::DataBlocked { limit: get_varint(buf)? }),
            FrameType::STREAM_DATA_BLOCKED => Ok(Frame::StreamDataBlocked {
                stream_id: get_varint(buf)?,
                limit: get_varint(buf)?,
            }),
            FrameType::STREAMS_BLOCKED_BIDI => Ok(Frame::StreamsBlockedBidi { limit: get_varint(buf)? }),
            FrameType::STREAMS_BLOCKED_UNI => Ok(Frame::StreamsBlockedUni { limit: get_varint(buf)? }),
            FrameType::NEW_CONNECTION_ID => {
                let seq = get_varint(buf)?;
                let retire_prior_to = get_varint(buf)?;
                require(buf.remaining() >= 1, TransportError::FrameEncodingError, "new_connection_id truncated")?;
                let cid_len = buf.get_u8() as usize;
                require(
                    (1..=20).contains(&cid_len),
                    TransportError::FrameEncodingError,
                    "new_connection_id length must be in 1..=20",
                )?;
                let cid = ConnectionId::new(&get_bytes(buf, cid_len)?)?;
                let token_bytes = get_bytes(buf, STATELESS_RESET_TOKEN_LEN)?;
                let mut reset_token = [0u8; STATELESS_RESET_TOKEN_LEN];
                reset_token.copy_from_slice(&token_bytes);
                Ok(Frame::NewConnectionId { seq, retire_prior_to, cid, reset_token })
            }
            FrameType::RETIRE_CONNECTION_ID => Ok(Frame::RetireConnectionId { seq: get_varint(buf)? }),
            FrameType::PATH_CHALLENGE => {
                let bytes = get_bytes(buf, 8)?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&bytes);
                Ok(Frame::PathChallenge { data })
            }
            FrameType::PATH_RESPONSE => {
                let bytes = get_bytes(buf, 8)?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&bytes);
                Ok(Frame::PathResponse { data })
            }
            FrameType::CONNECTION_CLOSE_TRANSPORT => {
                let error_code = get_varint(buf)?;
                let frame_type = get_varint(buf)?;
                let len = get_varint(buf)? as usize;
                Ok(Frame::ConnectionCloseTransport { error_code, frame_type, reason: get_bytes(buf, len)? })
            }
            FrameType::CONNECTION_CLOSE_APPLICATION => {
                let error_code = get_varint(buf)?;
                let len = get_varint(buf)? as usize;
                Ok(Frame::ConnectionCloseApplication { error_code, reason: get_bytes(buf, len)? })
            }
            FrameType::HANDSHAKE_DONE => Ok(Frame::HandshakeDone),
            _ => Err(QuicheError::protocol(TransportError::FrameEncodingError, "unknown frame type")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(frame: Frame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        let mut slice = buf.as_slice();
        let decoded = Frame::decode(&mut slice).unwrap();
        assert_eq!(decoded, frame);
        assert!(slice.is_empty());
    }

    #[test]
    fn padding_ping_and_handshake_done_round_trip() {
        roundtrip(Frame::Padding);
        roundtrip(Frame::Ping);
        roundtrip(Frame::HandshakeDone);
    }

    #[test]
    fn ack_frame_with_multiple_ranges_round_trips() {
        // matches §8 scenario 5: acked = {1, 6..10}
        roundtrip(Frame::Ack { ranges: vec![(6, 10), (1, 1)], ack_delay: 42 });
    }

    #[test]
    fn ack_frame_single_range_round_trips() {
        roundtrip(Frame::Ack { ranges: vec![(0, 0)], ack_delay: 0 });
    }

    #[test]
    fn stream_frame_round_trips_with_fin() {
        roundtrip(Frame::Stream { stream_id: 4, offset: 100, fin: true, data: b"hello".to_vec() });
    }

    #[test]
    fn stream_frame_without_len_consumes_rest_of_packet() {
        let mut buf = Vec::new();
        // OFF but not LEN: type 0x0c (STREAM | OFF)
        put_varint(&mut buf, FrameType::STREAM | STREAM_OFF_BIT).unwrap();
        put_varint(&mut buf, 9).unwrap(); // stream id
        put_varint(&mut buf, 0).unwrap(); // offset
        buf.extend_from_slice(b"trailing");

        let mut slice = buf.as_slice();
        let decoded = Frame::decode(&mut slice).unwrap();
        assert_eq!(
            decoded,
            Frame::Stream { stream_id: 9, offset: 0, fin: false, data: b"trailing".to_vec() }
        );
    }

    #[test]
    fn crypto_frame_round_trips() {
        roundtrip(Frame::Crypto { offset: 0, data: b"client hello".to_vec() });
    }

    #[test]
    fn new_connection_id_round_trips() {
        roundtrip(Frame::NewConnectionId {
            seq: 1,
            retire_prior_to: 0,
            cid: ConnectionId::new(&[1, 2, 3, 4]).unwrap(),
            reset_token: [7u8; STATELESS_RESET_TOKEN_LEN],
        });
    }

    #[test]
    fn connection_close_variants_round_trip() {
        roundtrip(Frame::ConnectionCloseTransport {
            error_code: TransportError::ProtocolViolation as u64,
            frame_type: 0,
            reason: b"bad framing".to_vec(),
        });
        roundtrip(Frame::ConnectionCloseApplication { error_code: 0, reason: vec![] });
    }

    #[test]
    fn path_challenge_and_response_round_trip() {
        roundtrip(Frame::PathChallenge { data: [1, 2, 3, 4, 5, 6, 7, 8] });
        roundtrip(Frame::PathResponse { data: [8, 7, 6, 5, 4, 3, 2, 1] });
    }

    #[test]
    fn stream_offset_plus_length_overflow_is_rejected() {
        let mut buf = Vec::new();
        put_varint(&mut buf, FrameType::STREAM | STREAM_OFF_BIT | STREAM_LEN_BIT).unwrap();
        put_varint(&mut buf, 0).unwrap();
        put_varint(&mut buf, VarInt::MAX.into_inner() - 1).unwrap();
        put_varint(&mut buf, 5).unwrap();
        buf.extend_from_slice(b"hello");

        let mut slice = buf.as_slice();
        assert!(Frame::decode(&mut slice).is_err());
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 0x3f).unwrap();
        let mut slice = buf.as_slice();
        assert!(Frame::decode(&mut slice).is_err());
    }
}
