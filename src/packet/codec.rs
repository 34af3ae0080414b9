use thiserror::Error;

use crate::crypto::aead;
use crate::crypto::header_protection;
use crate::crypto::keys::PacketKeys;
use crate::pnspace::{reconstruct_pn, truncate_pn, PacketNumberSpace};
use crate::primitives::varint::VarInt;
use crate::result::{require, QuicheError, QuicheResult, TransportError};

use super::header::Header;

/// Maximum size of a single UDP datagram this codec will produce, matching
/// common path MTU assumptions (§8's 1200-byte Initial floor plus headroom).
pub const MAX_DATAGRAM_SIZE: usize = 1452;
pub const MIN_INITIAL_DATAGRAM_SIZE: usize = 1200;

/// A fully decoded inbound packet: header, reconstructed packet number, and
/// the decrypted payload (frame bytes). `consumed` is the number of bytes of
/// the *original* datagram this packet occupied, enabling the caller to
/// locate any coalesced packet that follows (§4.1 "Coalescing").
pub struct DecodedPacket {
    pub header: Header,
    pub packet_number: u64,
    pub payload: Vec<u8>,
    pub consumed: usize,
}

/// A decode failure paired with how many bytes of the datagram the failed
/// packet occupied, when that boundary was already established before the
/// failure (i.e. the packet's Length field, or short-header "rest of
/// datagram" rule, was read before AEAD open failed). `consumed` is `None`
/// when the failure happened before any boundary was known, meaning nothing
/// past this point in the datagram can be located either.
///
/// `Connection::recv_datagram`'s coalesced-packet loop uses `consumed` to
/// skip past exactly the failed packet and keep decoding whatever coalesced
/// packet follows (§4.1 "Coalescing"), instead of dropping the rest of the
/// datagram on one bad or duplicate packet.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct PacketDecodeError {
    pub error: QuicheError,
    pub consumed: Option<usize>,
}

impl From<QuicheError> for PacketDecodeError {
    fn from(error: QuicheError) -> Self {
        Self { error, consumed: None }
    }
}

/// Seals and header-protects one Initial/0-RTT/Handshake packet into `out`,
/// returning the number of bytes written. `payload` is the plaintext frame
/// bytes (already assembled by the frame layer).
pub fn encode_long_packet(
    header: &Header,
    packet_number: u64,
    space: &PacketNumberSpace,
    keys: &PacketKeys,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> QuicheResult<usize> {
    require(header.is_long(), TransportError::InternalError, "encode_long_packet needs a long header")?;

    let pn_len = space.needed_pn_len(packet_number).max(1);
    let truncated = truncate_pn(packet_number, pn_len);

    let start = out.len();
    let mut prefix = header.encode_long_prefix((pn_len as u8 - 1) & 0x03)?;
    out.append(&mut prefix);

    let length = VarInt::from_u64((pn_len + payload.len() + aead::AEAD_TAG_LEN) as u64)?;
    length.encode(out);

    let pn_offset = out.len();
    for i in (0..pn_len).rev() {
        out.push((truncated >> (8 * i)) as u8);
    }

    let mut sealed_payload = payload.to_vec();
    let aad = out[start..].to_vec();
    aead::seal(keys, packet_number, &aad, &mut sealed_payload)?;
    out.extend_from_slice(&sealed_payload);

    header_protection::protect(&keys.hp, &mut out[start..], pn_offset - start, pn_len, true)?;

    Ok(out.len() - start)
}

/// Seals and header-protects one 1-RTT (short-header) packet.
pub fn encode_short_packet(
    header: &Header,
    packet_number: u64,
    space: &PacketNumberSpace,
    keys: &PacketKeys,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> QuicheResult<usize> {
    require(!header.is_long(), TransportError::InternalError, "encode_short_packet needs a short header")?;

    let pn_len = space.needed_pn_len(packet_number).max(1);
    let truncated = truncate_pn(packet_number, pn_len);

    let start = out.len();
    let mut prefix = header.encode_short_prefix((pn_len as u8 - 1) & 0x03)?;
    out.append(&mut prefix);

    let pn_offset = out.len();
    for i in (0..pn_len).rev() {
        out.push((truncated >> (8 * i)) as u8);
    }

    let mut sealed_payload = payload.to_vec();
    let aad = out[start..].to_vec();
    aead::seal(keys, packet_number, &aad, &mut sealed_payload)?;
    out.extend_from_slice(&sealed_payload);

    header_protection::protect(&keys.hp, &mut out[start..], pn_offset - start, pn_len, false)?;

    Ok(out.len() - start)
}

/// Decodes one long-header packet from the front of `datagram`, given the
/// epoch keys matching its type and the receiving packet-number space (used
/// for pn reconstruction against `recv_all`'s maximum). On success, the
/// returned `DecodedPacket::consumed` tells the caller where any coalesced
/// packet begins.
pub fn decode_long_packet(
    datagram: &[u8],
    keys: &PacketKeys,
    space: &PacketNumberSpace,
) -> Result<DecodedPacket, PacketDecodeError> {
    let (header, pn_offset, length) = Header::decode_long(datagram)?;
    let length = length.ok_or_else(|| {
        QuicheError::protocol(TransportError::ProtocolViolation, "packet type has no Length field")
    })? as usize;

    require(
        pn_offset + length <= datagram.len(),
        TransportError::ProtocolViolation,
        "declared Length overruns datagram",
    )?;
    let packet_end = pn_offset + length;

    let mut buf = datagram[..packet_end].to_vec();
    let pn_len = header_protection::unprotect(&keys.hp, &mut buf, pn_offset, true)
        .map_err(|error| PacketDecodeError { error, consumed: Some(packet_end) })?;

    let mut truncated: u64 = 0;
    for i in 0..pn_len {
        truncated = (truncated << 8) | buf[pn_offset + i] as u64;
    }
    let packet_number = reconstruct_pn(truncated, pn_len, space.recv_all.max());

    let aad = buf[..pn_offset + pn_len].to_vec();
    let plaintext = aead::open(keys, packet_number, &aad, &mut buf[pn_offset + pn_len..])
        .map_err(|error| PacketDecodeError { error, consumed: Some(packet_end) })?;
    let payload = plaintext.to_vec();

    Ok(DecodedPacket {
        header,
        packet_number,
        payload,
        consumed: packet_end,
    })
}

/// Decodes one short-header (1-RTT) packet occupying the rest of the
/// datagram (short headers are never coalesced after, since nothing legally
/// follows a Short packet per the coalescing order in §4.1).
///
/// `alternate_keys`, when given, is tried for the AEAD open if `keys` (the
/// current key phase) fails — header protection keys are not rotated by a
/// key update (RFC 9001 §6), so the header is always unprotected correctly
/// regardless of which phase actually sealed the payload, and only the
/// packet-protection key can mismatch. Returns whether `alternate_keys` was
/// the one that actually opened the packet, so the caller knows whether to
/// commit a pending key-phase flip.
pub fn decode_short_packet(
    datagram: &[u8],
    dcid_len: usize,
    keys: &PacketKeys,
    alternate_keys: Option<&PacketKeys>,
    space: &PacketNumberSpace,
) -> Result<(DecodedPacket, bool), PacketDecodeError> {
    let (mut header, pn_offset) = Header::decode_short(datagram, dcid_len)?;
    let consumed = datagram.len();

    let mut buf = datagram.to_vec();
    let pn_len = header_protection::unprotect(&keys.hp, &mut buf, pn_offset, false)
        .map_err(|error| PacketDecodeError { error, consumed: Some(consumed) })?;

    // The key-phase bit lives inside the header-protection mask (low 5 bits
    // of the first byte, §4.1/§9); the value `Header::decode_short` read
    // before `unprotect` ran is meaningless, so overwrite it now that the
    // byte is genuinely unmasked.
    if let Header::Short { key_phase, .. } = &mut header {
        *key_phase = buf[0] & super::types::SHORT_KEY_PHASE_BIT != 0;
    }

    let mut truncated: u64 = 0;
    for i in 0..pn_len {
        truncated = (truncated << 8) | buf[pn_offset + i] as u64;
    }
    let packet_number = reconstruct_pn(truncated, pn_len, space.recv_all.max());
    let aad = buf[..pn_offset + pn_len].to_vec();

    let mut ciphertext = buf[pn_offset + pn_len..].to_vec();
    match aead::open(keys, packet_number, &aad, &mut ciphertext) {
        Ok(plaintext) => {
            let payload = plaintext.to_vec();
            Ok((DecodedPacket { header, packet_number, payload, consumed }, false))
        }
        Err(primary_err) => {
            let Some(alt) = alternate_keys else {
                return Err(PacketDecodeError { error: primary_err, consumed: Some(consumed) });
            };
            let mut ciphertext = buf[pn_offset + pn_len..].to_vec();
            let plaintext = aead::open(alt, packet_number, &aad, &mut ciphertext)
                .map_err(|error| PacketDecodeError { error, consumed: Some(consumed) })?;
            let payload = plaintext.to_vec();
            Ok((DecodedPacket { header, packet_number, payload, consumed }, true))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::keys::derive_initial_keys;
    use crate::primitives::cid::ConnectionId;

    #[test]
    fn long_packet_round_trips_through_seal_and_protect() {
        let dcid = ConnectionId::new(&[0xaa; 8]).unwrap();
        let scid = ConnectionId::new(&[0xbb; 4]).unwrap();
        let client_keys = derive_initial_keys(dcid.as_slice(), true).unwrap();
        let server_keys = derive_initial_keys(dcid.as_slice(), false).unwrap();

        let header = Header::Initial {
            version: super::super::types::QUIC_VERSION_1,
            dcid: dcid.clone(),
            scid: scid.clone(),
            token: vec![],
        };

        let mut space = PacketNumberSpace::new();
        let pn = space.next_send_pn();
        let payload = b"CRYPTO frame payload goes here".to_vec();

        let mut out = Vec::new();
        encode_long_packet(&header, pn, &space, &client_keys.local, &payload, &mut out).unwrap();

        let decoded = decode_long_packet(&out, &server_keys.remote, &PacketNumberSpace::new()).unwrap();
        assert_eq!(decoded.packet_number, pn);
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.consumed, out.len());
        assert_eq!(decoded.header, header);
    }

    #[test]
    fn bit_flip_anywhere_in_packet_fails_to_open() {
        let dcid = ConnectionId::new(&[1; 8]).unwrap();
        let scid = ConnectionId::new(&[2; 4]).unwrap();
        let client_keys = derive_initial_keys(dcid.as_slice(), true).unwrap();
        let server_keys = derive_initial_keys(dcid.as_slice(), false).unwrap();

        let header = Header::Initial {
            version: super::super::types::QUIC_VERSION_1,
            dcid,
            scid,
            token: vec![],
        };
        let mut space = PacketNumberSpace::new();
        let pn = space.next_send_pn();
        let payload = b"hello".to_vec();

        let mut out = Vec::new();
        encode_long_packet(&header, pn, &space, &client_keys.local, &payload, &mut out).unwrap();

        let last = out.len() - 1;
        out[last] ^= 0x01;
        let err = decode_long_packet(&out, &server_keys.remote, &PacketNumberSpace::new()).unwrap_err();
        assert_eq!(err.consumed, Some(out.len()));
    }

    #[test]
    fn short_packet_round_trips() {
        let dcid = ConnectionId::new(&[3; 8]).unwrap();
        let client_keys = derive_initial_keys(dcid.as_slice(), true).unwrap();
        let server_keys = derive_initial_keys(dcid.as_slice(), false).unwrap();

        let header = Header::Short {
            dcid: dcid.clone(),
            spin: false,
            key_phase: false,
        };
        let mut space = PacketNumberSpace::new();
        let pn = space.next_send_pn();
        let payload = b"stream bytes".to_vec();

        let mut out = Vec::new();
        encode_short_packet(&header, pn, &space, &client_keys.local, &payload, &mut out).unwrap();

        let (decoded, used_alternate) =
            decode_short_packet(&out, dcid.len(), &server_keys.remote, None, &PacketNumberSpace::new()).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.packet_number, pn);
        assert!(!used_alternate);
    }

    #[test]
    fn decode_short_packet_retries_with_alternate_keys_on_phase_flip() {
        let dcid = ConnectionId::new(&[6; 8]).unwrap();
        let client_keys = derive_initial_keys(dcid.as_slice(), true).unwrap();
        let server_keys = derive_initial_keys(dcid.as_slice(), false).unwrap();

        // The peer flips phase: it seals with its *next*-generation AEAD key
        // while header protection (unchanged per RFC 9001 §6) still uses the
        // current epoch's hp key.
        let client_next_local = client_keys.local.next().unwrap();

        let header = Header::Short { dcid: dcid.clone(), spin: false, key_phase: true };
        let mut space = PacketNumberSpace::new();
        let pn = space.next_send_pn();
        let payload = b"post-flip payload".to_vec();

        let mut out = Vec::new();
        encode_short_packet(&header, pn, &space, &client_next_local, &payload, &mut out).unwrap();

        // Decoding with only the current-phase remote keys must fail...
        let current_only =
            decode_short_packet(&out, dcid.len(), &server_keys.remote, None, &PacketNumberSpace::new());
        assert!(current_only.is_err());

        // ...but succeed once the next-phase remote keys are offered as the alternate.
        let server_next_remote = server_keys.remote.next().unwrap();
        let (decoded, used_alternate) = decode_short_packet(
            &out,
            dcid.len(),
            &server_keys.remote,
            Some(&server_next_remote),
            &PacketNumberSpace::new(),
        )
        .unwrap();
        assert!(used_alternate);
        assert_eq!(decoded.payload, payload);
        if let Header::Short { key_phase, .. } = decoded.header {
            assert!(key_phase);
        } else {
            panic!("expected short header");
        }
    }

    #[test]
    fn pn_zero_is_legal() {
        let dcid = ConnectionId::new(&[4; 8]).unwrap();
        let client_keys = derive_initial_keys(dcid.as_slice(), true).unwrap();
        let server_keys = derive_initial_keys(dcid.as_slice(), false).unwrap();
        let header = Header::Initial {
            version: super::super::types::QUIC_VERSION_1,
            dcid,
            scid: ConnectionId::new(&[5; 4]).unwrap(),
            token: vec![],
        };
        let space = PacketNumberSpace::new();
        let mut out = Vec::new();
        encode_long_packet(&header, 0, &space, &client_keys.local, b"x", &mut out).unwrap();
        let decoded = decode_long_packet(&out, &server_keys.remote, &PacketNumberSpace::new()).unwrap();
        assert_eq!(decoded.packet_number, 0);
    }
}
