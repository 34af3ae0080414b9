use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, NONCE_LEN};

use crate::packet::header::{Header, RETRY_TAG_LEN};
use crate::primitives::cid::ConnectionId;
use crate::result::{QuicheError, QuicheResult};

/// Fixed version-1 Retry Integrity key/nonce (RFC 9001 §5.8). Unlike every
/// other AEAD key in this crate these are NOT derived per-connection — they
/// are constants baked into the QUIC v1 spec, shared by every endpoint.
const RETRY_INTEGRITY_KEY: [u8; 16] = [
    0xcc, 0xce, 0x18, 0x7e, 0xd0, 0x9a, 0x09, 0xd0, 0x57, 0x28, 0x15, 0x5a, 0x6c, 0xb9, 0x6b, 0xe1,
];
const RETRY_INTEGRITY_NONCE: [u8; NONCE_LEN] = [
    0xe5, 0x49, 0x30, 0xf9, 0x7f, 0x21, 0x36, 0xf0, 0x53, 0x0a, 0x8c, 0x1c,
];

fn retry_key() -> LessSafeKey {
    let unbound = UnboundKey::new(&AES_128_GCM, &RETRY_INTEGRITY_KEY).expect("fixed-length retry key");
    LessSafeKey::new(unbound)
}

/// Builds the associated data RFC 9001 §5.8 calls the "Retry Pseudo-Packet":
/// the client's original destination CID (length-prefixed), followed by the
/// Retry packet's on-wire bytes excluding the integrity tag.
fn pseudo_header(odcid: &ConnectionId, retry_without_tag: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + odcid.len() + retry_without_tag.len());
    out.push(odcid.len() as u8);
    out.extend_from_slice(odcid.as_slice());
    out.extend_from_slice(retry_without_tag);
    out
}

/// Computes the 16-byte Retry Integrity Tag for a Retry header whose
/// `token`/`dcid`/`scid` are already filled in (the `retry_tag` field is
/// ignored on input).
pub fn compute_tag(header: &Header, odcid: &ConnectionId) -> QuicheResult<[u8; RETRY_TAG_LEN]> {
    let without_tag = header.encode_retry_without_tag()?;
    let aad = pseudo_header(odcid, &without_tag);
    let key = retry_key();
    let nonce = Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE);
    let mut tag_buf = Vec::new(); // empty plaintext: GCM over AAD only, tag covers everything
    key.seal_in_place_append_tag(nonce, Aad::from(&aad), &mut tag_buf)
        .map_err(|_| QuicheError::Crypto("retry integrity seal failed".into()))?;
    let mut tag = [0u8; RETRY_TAG_LEN];
    tag.copy_from_slice(&tag_buf);
    Ok(tag)
}

/// Verifies a received Retry packet's integrity tag against the client's
/// remembered original destination CID.
pub fn verify_tag(header: &Header, odcid: &ConnectionId) -> QuicheResult<()> {
    let Header::Retry { retry_tag, .. } = header else {
        return Err(QuicheError::Other("verify_tag requires a Retry header".into()));
    };
    let expected = compute_tag(header, odcid)?;
    if expected == *retry_tag {
        Ok(())
    } else {
        Err(QuicheError::Crypto("retry integrity tag mismatch".into()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn computed_tag_verifies_and_bit_flip_fails() {
        let odcid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut header = Header::Retry {
            version: crate::packet::types::QUIC_VERSION_1,
            dcid: ConnectionId::new(&[9; 4]).unwrap(),
            scid: ConnectionId::new(&[8; 8]).unwrap(),
            token: b"token-bytes".to_vec(),
            retry_tag: [0; RETRY_TAG_LEN],
        };
        let tag = compute_tag(&header, &odcid).unwrap();
        if let Header::Retry { retry_tag, .. } = &mut header {
            *retry_tag = tag;
        }
        assert!(verify_tag(&header, &odcid).is_ok());

        if let Header::Retry { retry_tag, .. } = &mut header {
            retry_tag[0] ^= 0x01;
        }
        assert!(verify_tag(&header, &odcid).is_err());
    }
}
