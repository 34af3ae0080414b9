use ring::aead::quic::HeaderProtectionKey;

use crate::result::{QuicheError, QuicheResult};

pub const SAMPLE_LEN: usize = 16;

/// Computes the 5-byte mask for a 16-byte sample. Byte 0 masks the low bits of
/// the first header byte (4 bits for long headers, 5 for short); bytes 1..=4
/// mask up to 4 packet-number bytes.
fn mask(hp: &HeaderProtectionKey, sample: &[u8]) -> QuicheResult<[u8; 5]> {
    hp.new_mask(sample)
        .map_err(|_| QuicheError::Crypto("header protection mask failed".into()))
}

/// Applies header protection to an outbound packet already sealed (so the
/// sample bytes — which live inside the ciphertext — are final). `pn_offset`
/// is the offset of the first packet-number byte; `pn_len` its length in
/// bytes (1-4). `is_long` selects the first-byte mask width.
///
/// Per §4.1 / §9, sealing MUST happen before this call on transmit.
pub fn protect(
    hp: &HeaderProtectionKey,
    buf: &mut [u8],
    pn_offset: usize,
    pn_len: usize,
    is_long: bool,
) -> QuicheResult<()> {
    let sample_offset = pn_offset + 4;
    let sample = buf
        .get(sample_offset..sample_offset + SAMPLE_LEN)
        .ok_or_else(|| QuicheError::Crypto("not enough bytes for hp sample".into()))?;
    let m = mask(hp, sample)?;

    let first_mask = if is_long { 0x0f } else { 0x1f };
    buf[0] ^= m[0] & first_mask;
    for i in 0..pn_len {
        buf[pn_offset + i] ^= m[1 + i];
    }
    Ok(())
}

/// Removes header protection on an inbound packet. `pn_offset` is the offset
/// of the (still masked) packet-number field; the caller does not yet know
/// `pn_len` — it is exposed by this call via the unmasked first byte.
///
/// Per §4.1 / §9, this MUST happen before AEAD opening on receive.
pub fn unprotect(
    hp: &HeaderProtectionKey,
    buf: &mut [u8],
    pn_offset: usize,
    is_long: bool,
) -> QuicheResult<usize> {
    let sample_offset = pn_offset + 4;
    let sample = buf
        .get(sample_offset..sample_offset + SAMPLE_LEN)
        .ok_or_else(|| QuicheError::Crypto("not enough bytes for hp sample".into()))?;
    let m = mask(hp, sample)?;

    let first_mask = if is_long { 0x0f } else { 0x1f };
    buf[0] ^= m[0] & first_mask;
    let pn_len = (buf[0] & 0x03) as usize + 1;
    for i in 0..pn_len {
        buf[pn_offset + i] ^= m[1 + i];
    }
    Ok(pn_len)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::keys::derive_initial_keys;

    #[test]
    fn protect_then_unprotect_is_identity() {
        let dcid = [5u8; 8];
        let keys = derive_initial_keys(&dcid, true).unwrap();

        // header_form=1, fixed=1, type=Initial(00), reserved=00, pnl=00 (1-byte pn)
        let mut buf = vec![0xc0u8, 0, 0, 0, 0];
        buf.extend_from_slice(&[0u8; SAMPLE_LEN]);
        let original = buf.clone();

        protect(&keys.local.hp, &mut buf, 4, 1, true).unwrap();
        assert_ne!(buf[0], original[0]);

        let pn_len = unprotect(&keys.local.hp, &mut buf, 4, true).unwrap();
        assert_eq!(pn_len, 1);
        assert_eq!(buf, original);
    }
}
