use bytes::{Buf, BufMut};

use crate::primitives::cid::ConnectionId;
use crate::primitives::varint::VarInt;
use crate::result::{require, QuicheError, QuicheResult, TransportError};

use super::types::{
    is_long_header, LongPacketType, FIXED_BIT, LONG_HEADER_BIT, QUIC_VERSION_1, SHORT_KEY_PHASE_BIT,
    SHORT_SPIN_BIT,
};

pub const RETRY_TAG_LEN: usize = 16;

/// A decoded (but not yet packet-number-reconstructed) QUIC header. Long
/// headers carry everything up to, but not including, the packet-number
/// field; short headers carry everything up to the (pre-negotiated-length)
/// destination CID. The packet-number bytes themselves stay header-protected
/// until `crypto::header_protection::unprotect` runs, per §4.1/§9.
#[derive(Debug, PartialEq, Eq)]
pub enum Header {
    Initial {
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Vec<u8>,
    },
    ZeroRtt {
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    Handshake {
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    Retry {
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Vec<u8>,
        retry_tag: [u8; RETRY_TAG_LEN],
    },
    VersionNegotiation {
        dcid: ConnectionId,
        scid: ConnectionId,
        supported: Vec<u32>,
    },
    Short {
        dcid: ConnectionId,
        spin: bool,
        key_phase: bool,
    },
}

impl Header {
    pub fn is_long(&self) -> bool {
        !matches!(self, Header::Short { .. })
    }

    pub fn dcid(&self) -> &ConnectionId {
        match self {
            Header::Initial { dcid, .. }
            | Header::ZeroRtt { dcid, .. }
            | Header::Handshake { dcid, .. }
            | Header::Retry { dcid, .. }
            | Header::VersionNegotiation { dcid, .. }
            | Header::Short { dcid, .. } => dcid,
        }
    }

    pub fn long_packet_type(&self) -> Option<LongPacketType> {
        match self {
            Header::Initial { .. } => Some(LongPacketType::Initial),
            Header::ZeroRtt { .. } => Some(LongPacketType::ZeroRtt),
            Header::Handshake { .. } => Some(LongPacketType::Handshake),
            Header::Retry { .. } => Some(LongPacketType::Retry),
            Header::VersionNegotiation { .. } | Header::Short { .. } => None,
        }
    }

    fn encode_cid(buf: &mut Vec<u8>, cid: &ConnectionId) {
        buf.push(cid.len() as u8);
        buf.extend_from_slice(cid.as_slice());
    }

    /// Encodes everything up to (not including) the packet-number field, for
    /// Initial/0-RTT/Handshake headers. The caller appends the `Length`
    /// varint (pn_len + payload_len + tag_len) immediately after this, since
    /// that value isn't known until the payload is assembled.
    pub fn encode_long_prefix(&self, reserved_and_pnlen_bits: u8) -> QuicheResult<Vec<u8>> {
        let (version, dcid, scid, long_type) = match self {
            Header::Initial { version, dcid, scid, .. } => (*version, dcid, scid, LongPacketType::Initial),
            Header::ZeroRtt { version, dcid, scid } => (*version, dcid, scid, LongPacketType::ZeroRtt),
            Header::Handshake { version, dcid, scid } => (*version, dcid, scid, LongPacketType::Handshake),
            _ => {
                return Err(QuicheError::Other(
                    "encode_long_prefix only applies to Initial/0-RTT/Handshake".into(),
                ))
            }
        };

        let mut buf = Vec::with_capacity(7 + dcid.len() + scid.len());
        let first_byte = LONG_HEADER_BIT
            | FIXED_BIT
            | (long_type.to_bits() << 4)
            | (reserved_and_pnlen_bits & 0x0f);
        buf.push(first_byte);
        buf.put_u32(version);
        Self::encode_cid(&mut buf, dcid);
        Self::encode_cid(&mut buf, scid);

        if let Header::Initial { token, .. } = self {
            VarInt::from_u64(token.len() as u64)?.encode(&mut buf);
            buf.extend_from_slice(token);
        }

        Ok(buf)
    }

    /// Encodes the Retry packet proper (everything but the integrity tag,
    /// which the caller computes over these bytes plus the client's original
    /// DCID and appends separately — RFC 9001 §5.8's "pseudo-header" is not
    /// itself part of the wire packet).
    pub fn encode_retry_without_tag(&self) -> QuicheResult<Vec<u8>> {
        let Header::Retry { version, dcid, scid, token, .. } = self else {
            return Err(QuicheError::Other("encode_retry requires a Retry header".into()));
        };
        let mut buf = Vec::new();
        buf.push(LONG_HEADER_BIT | FIXED_BIT | (LongPacketType::Retry.to_bits() << 4));
        buf.put_u32(*version);
        Self::encode_cid(&mut buf, dcid);
        Self::encode_cid(&mut buf, scid);
        buf.extend_from_slice(token);
        Ok(buf)
    }

    pub fn encode_retry(&self) -> QuicheResult<Vec<u8>> {
        let Header::Retry { retry_tag, .. } = self else {
            return Err(QuicheError::Other("encode_retry requires a Retry header".into()));
        };
        let mut buf = self.encode_retry_without_tag()?;
        buf.extend_from_slice(retry_tag);
        Ok(buf)
    }

    pub fn encode_version_negotiation(&self) -> QuicheResult<Vec<u8>> {
        let Header::VersionNegotiation { dcid, scid, supported } = self else {
            return Err(QuicheError::Other("requires a VersionNegotiation header".into()));
        };
        let mut buf = Vec::new();
        // high bit set, rest of the byte is unspecified/random ("greasing")
        buf.push(LONG_HEADER_BIT);
        buf.put_u32(0);
        Self::encode_cid(&mut buf, dcid);
        Self::encode_cid(&mut buf, scid);
        for &v in supported {
            buf.put_u32(v);
        }
        Ok(buf)
    }

    /// Encodes the fixed-length-CID short header's first byte + dcid, with
    /// the packet-number length bits already folded in (the actual masking
    /// of those bits happens later, during header protection).
    pub fn encode_short_prefix(&self, pnlen_bits: u8) -> QuicheResult<Vec<u8>> {
        let Header::Short { dcid, spin, key_phase } = self else {
            return Err(QuicheError::Other("encode_short_prefix requires a Short header".into()));
        };
        let mut buf = Vec::with_capacity(1 + dcid.len());
        let mut first = FIXED_BIT;
        if *spin {
            first |= SHORT_SPIN_BIT;
        }
        if *key_phase {
            first |= SHORT_KEY_PHASE_BIT;
        }
        first |= pnlen_bits & 0x03;
        buf.push(first);
        buf.extend_from_slice(dcid.as_slice());
        Ok(buf)
    }

    /// Parses everything up to the packet-number field from a long-header
    /// datagram. Returns the header, the offset of the as-yet-protected
    /// packet-number field, and (for Initial/0-RTT/Handshake) the declared
    /// `Length` value covering pn + payload + tag.
    pub fn decode_long(buf: &[u8]) -> QuicheResult<(Header, usize, Option<u64>)> {
        require(buf.len() >= 7, TransportError::ProtocolViolation, "long header too short")?;
        let first_byte = buf[0];
        require(is_long_header(first_byte), TransportError::ProtocolViolation, "not a long header")?;

        let version = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        let mut pos = 5;

        let dcid_len = buf[pos] as usize;
        pos += 1;
        require(pos + dcid_len <= buf.len(), TransportError::ProtocolViolation, "dcid overruns packet")?;
        let dcid = ConnectionId::new(&buf[pos..pos + dcid_len])?;
        pos += dcid_len;

        require(pos < buf.len(), TransportError::ProtocolViolation, "missing scid length")?;
        let scid_len = buf[pos] as usize;
        pos += 1;
        require(pos + scid_len <= buf.len(), TransportError::ProtocolViolation, "scid overruns packet")?;
        let scid = ConnectionId::new(&buf[pos..pos + scid_len])?;
        pos += scid_len;

        if version == 0 {
            let mut supported = Vec::new();
            let mut rest = &buf[pos..];
            while rest.remaining() >= 4 {
                supported.push(rest.get_u32());
            }
            return Ok((Header::VersionNegotiation { dcid, scid, supported }, pos, None));
        }

        let long_type = LongPacketType::from_bits(first_byte >> 4);
        match long_type {
            LongPacketType::Retry => {
                require(
                    buf.len() >= pos + RETRY_TAG_LEN,
                    TransportError::ProtocolViolation,
                    "retry packet missing integrity tag",
                )?;
                let token = buf[pos..buf.len() - RETRY_TAG_LEN].to_vec();
                let mut retry_tag = [0u8; RETRY_TAG_LEN];
                retry_tag.copy_from_slice(&buf[buf.len() - RETRY_TAG_LEN..]);
                Ok((
                    Header::Retry { version, dcid, scid, token, retry_tag },
                    buf.len(),
                    None,
                ))
            }
            LongPacketType::Initial => {
                let mut rest = &buf[pos..];
                let token_len = VarInt::decode(&mut rest)?.into_usize()?;
                let consumed_for_varint = (buf.len() - pos) - rest.remaining();
                pos += consumed_for_varint;
                require(pos + token_len <= buf.len(), TransportError::ProtocolViolation, "token overruns packet")?;
                let token = buf[pos..pos + token_len].to_vec();
                pos += token_len;

                let mut rest = &buf[pos..];
                let length = VarInt::decode(&mut rest)?;
                let consumed_for_len = (buf.len() - pos) - rest.remaining();
                pos += consumed_for_len;

                Ok((Header::Initial { version, dcid, scid, token }, pos, Some(length.into_inner())))
            }
            LongPacketType::ZeroRtt | LongPacketType::Handshake => {
                let mut rest = &buf[pos..];
                let length = VarInt::decode(&mut rest)?;
                let consumed_for_len = (buf.len() - pos) - rest.remaining();
                pos += consumed_for_len;

                let header = if long_type == LongPacketType::ZeroRtt {
                    Header::ZeroRtt { version, dcid, scid }
                } else {
                    Header::Handshake { version, dcid, scid }
                };
                Ok((header, pos, Some(length.into_inner())))
            }
        }
    }

    /// Parses a short header's first byte + pre-negotiated-length DCID.
    /// `dcid_len` must come from the local endpoint's issued CID length,
    /// since the short header carries no length prefix.
    pub fn decode_short(buf: &[u8], dcid_len: usize) -> QuicheResult<(Header, usize)> {
        require(!buf.is_empty(), TransportError::ProtocolViolation, "short header empty")?;
        require(!is_long_header(buf[0]), TransportError::ProtocolViolation, "not a short header")?;
        require(buf.len() >= 1 + dcid_len, TransportError::ProtocolViolation, "short header truncated")?;

        let spin = buf[0] & SHORT_SPIN_BIT != 0;
        let key_phase = buf[0] & SHORT_KEY_PHASE_BIT != 0;
        let dcid = ConnectionId::new(&buf[1..1 + dcid_len])?;
        Ok((Header::Short { dcid, spin, key_phase }, 1 + dcid_len))
    }
}

pub fn default_version() -> u32 {
    QUIC_VERSION_1
}

#[cfg(test)]
mod test {
    use super::*;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::new(bytes).unwrap()
    }

    #[test]
    fn initial_header_round_trips_prefix() {
        let header = Header::Initial {
            version: QUIC_VERSION_1,
            dcid: cid(&[1, 2, 3, 4, 5, 6, 7, 8]),
            scid: cid(&[9, 9, 9, 9]),
            token: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let mut bytes = header.encode_long_prefix(0b00).unwrap();
        // append a fake Length + 1-byte pn + payload so decode_long has a tail
        VarInt::from_u32(5).unwrap().encode(&mut bytes);
        bytes.push(0); // pn
        bytes.extend_from_slice(b"abcd");

        let (decoded, pn_offset, length) = Header::decode_long(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(length, Some(5));
        assert_eq!(pn_offset, bytes.len() - 5);
    }

    #[test]
    fn version_negotiation_round_trips() {
        let header = Header::VersionNegotiation {
            dcid: cid(&[1, 2, 3]),
            scid: cid(&[4, 5]),
            supported: vec![QUIC_VERSION_1, 0x1a2a_3a4a],
        };
        let bytes = header.encode_version_negotiation().unwrap();
        let (decoded, _, length) = Header::decode_long(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(length, None);
    }

    #[test]
    fn short_header_round_trips() {
        let header = Header::Short {
            dcid: cid(&[7; 8]),
            spin: true,
            key_phase: false,
        };
        let bytes = header.encode_short_prefix(0b11).unwrap();
        let (decoded, consumed) = Header::decode_short(&bytes, 8).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(consumed, 9);
    }
}
