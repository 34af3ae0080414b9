use bytes::{Buf, BufMut};

use crate::result::{QuicheError, QuicheResult, TransportError};

/// QUIC's canonical variable-length integer (RFC 9000 §16). The top two bits
/// of the first byte select a length of 1, 2, 4, or 8 bytes; the remaining
/// bits (and any following bytes) hold the value big-endian.
// heavily inspired by quinn
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    pub const MAX: Self = Self((1 << 62) - 1);
    pub const ZERO: Self = Self(0);

    #[inline(always)]
    pub const fn from_u32(value: u32) -> Self {
        Self(value as u64)
    }

    pub fn from_u64(value: u64) -> QuicheResult<Self> {
        if value <= Self::MAX.0 {
            Ok(Self(value))
        } else {
            Err(QuicheError::protocol(
                TransportError::FrameEncodingError,
                "varint value exceeds 2^62-1",
            ))
        }
    }

    /// Caller is responsible for having validated `value <= VarInt::MAX`.
    pub const fn from_u64_unchecked(value: u64) -> Self {
        Self(value)
    }

    #[inline(always)]
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    pub fn into_usize(self) -> QuicheResult<usize> {
        usize::try_from(self.0)
            .map_err(|_| QuicheError::Other(format!("varint {} does not fit in usize", self.0)))
    }

    /// Number of bytes this value encodes to on the wire.
    pub const fn encoded_len(self) -> usize {
        if self.0 < (1 << 6) {
            1
        } else if self.0 < (1 << 14) {
            2
        } else if self.0 < (1 << 30) {
            4
        } else {
            8
        }
    }

    pub fn encode(self, buf: &mut impl BufMut) {
        let len = self.encoded_len();
        let prefix: u8 = match len {
            1 => 0b00,
            2 => 0b01,
            4 => 0b10,
            8 => 0b11,
            _ => unreachable!(),
        };
        let value = self.0;
        buf.put_u8((prefix << 6) | ((value >> (8 * (len - 1))) & 0x3f) as u8);
        for i in (0..len - 1).rev() {
            buf.put_u8((value >> (8 * i)) as u8);
        }
    }

    pub fn encode_to_vec(self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.encoded_len());
        self.encode(&mut v);
        v
    }

    /// Decodes a varint from the front of `buf`, advancing it past the bytes
    /// consumed. Returns an error on truncated input.
    pub fn decode(buf: &mut impl Buf) -> QuicheResult<Self> {
        if !buf.has_remaining() {
            return Err(QuicheError::protocol(
                TransportError::FrameEncodingError,
                "varint: no bytes remaining",
            ));
        }
        let first = buf.get_u8();
        let tag = first >> 6;
        let len = 1usize << tag; // 1, 2, 4, or 8
        let mut value = (first & 0x3f) as u64;
        if buf.remaining() < len - 1 {
            return Err(QuicheError::protocol(
                TransportError::FrameEncodingError,
                "varint: truncated",
            ));
        }
        for _ in 0..len - 1 {
            value = (value << 8) | buf.get_u8() as u64;
        }
        Ok(Self(value))
    }
}

impl Default for VarInt {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<VarInt> for u64 {
    fn from(v: VarInt) -> u64 {
        v.0
    }
}

impl TryFrom<u64> for VarInt {
    type Error = QuicheError;

    fn try_from(value: u64) -> QuicheResult<Self> {
        Self::from_u64(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn round_trips_boundary_values() {
        for &value in &[
            0u64, 1, 63, 64, 16_383, 16_384, 1 << 29, (1 << 30) - 1, 1 << 30, VarInt::MAX.0,
        ] {
            let v = VarInt::from_u64(value).unwrap();
            let mut buf = BytesMut::new();
            v.encode(&mut buf);
            assert_eq!(buf.len(), v.encoded_len());
            let mut frozen = buf.freeze();
            let decoded = VarInt::decode(&mut frozen).unwrap();
            assert_eq!(decoded, v);
            assert!(!frozen.has_remaining());
        }
    }

    #[test]
    fn fixed_vectors_from_rfc9000() {
        let varint = VarInt::from_u32(63);
        assert_eq!(varint.encode_to_vec(), vec![0b00_111111]);

        let varint = VarInt::from_u32(16_383);
        assert_eq!(varint.encode_to_vec(), vec![0b01_111111, 0b11_111111]);

        let varint = VarInt::from_u64(357_913_941).unwrap();
        assert_eq!(
            varint.encode_to_vec(),
            vec![0b10_010101, 0b01_010101, 0b01_010101, 0b01_010101]
        );

        let varint = VarInt::from_u64(1_537_228_672_809_129_301).unwrap();
        assert_eq!(
            varint.encode_to_vec(),
            vec![
                0b11_010101,
                0b01_010101,
                0b01_010101,
                0b01_010101,
                0b01_010101,
                0b01_010101,
                0b01_010101,
                0b01_010101,
            ]
        );
    }

    #[test]
    fn rejects_values_above_max() {
        assert!(VarInt::from_u64(1 << 62).is_err());
    }
}
