use ring::aead::quic::HeaderProtectionKey;
use ring::aead::{self, LessSafeKey, UnboundKey};
use ring::hkdf::{self, KeyType};

use crate::result::{QuicheError, QuicheResult};

/// The four key epochs a connection cycles through. 0-RTT shares the
/// Application packet-number space on the sender side (§3) but always has its
/// own key material, so it gets its own `Epoch` variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    Application = 3,
}

impl Epoch {
    pub const ALL: [Epoch; 4] = [Epoch::Initial, Epoch::ZeroRtt, Epoch::Handshake, Epoch::Application];
}

/// Version 1 Initial salt (RFC 9001 §5.2).
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0x4a, 0x4c, 0x80, 0xca,
    0xdc, 0xcb, 0xb7, 0x0a,
];

const HKDF_SHA256: hkdf::Algorithm = hkdf::HKDF_SHA256;
const AEAD_ALG: &aead::Algorithm = &aead::AES_128_GCM;
const HP_ALG: aead::quic::Algorithm = aead::quic::AES_128;

struct OkmLen(usize);

impl KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// `HKDF-Expand-Label` as defined by TLS 1.3 (RFC 8446 §7.1), used for every
/// secret/key/iv/hp derivation QUIC performs (RFC 9001 §5).
fn hkdf_expand_label(prk: &hkdf::Prk, label: &str, len: usize) -> QuicheResult<Vec<u8>> {
    let full_label = format!("tls13 {label}");
    let mut info = Vec::with_capacity(2 + 1 + full_label.len() + 1);
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push(full_label.len() as u8);
    info.extend_from_slice(full_label.as_bytes());
    info.push(0); // empty context

    let okm = prk
        .expand(&[&info], OkmLen(len))
        .map_err(|_| QuicheError::Crypto("hkdf-expand-label failed".into()))?;
    let mut out = vec![0u8; len];
    okm.fill(&mut out)
        .map_err(|_| QuicheError::Crypto("hkdf fill failed".into()))?;
    Ok(out)
}

/// One direction's fully-derived packet protection material for one epoch.
pub struct PacketKeys {
    pub aead: LessSafeKey,
    pub iv: [u8; 12],
    pub hp: HeaderProtectionKey,
    /// Raw traffic secret, retained so a key-phase update (§4.3) can derive
    /// the next generation via the "quic ku" label without re-running the
    /// whole handshake derivation.
    secret: Vec<u8>,
    /// The "quic hp" key material this epoch was derived with, retained so
    /// `next()` can carry it forward unchanged: RFC 9001 §6 is explicit that
    /// header protection keys are never updated by a key update, only the
    /// packet protection key and IV advance.
    hp_bytes: Vec<u8>,
}

impl PacketKeys {
    fn from_secret(secret: &[u8]) -> QuicheResult<Self> {
        // `secret` is already a PRK-strength traffic secret (an HKDF output),
        // not raw IKM, so wrap it directly rather than running Extract again.
        let prk = hkdf::Prk::new_less_safe(HKDF_SHA256, secret);
        let hp_bytes = hkdf_expand_label(&prk, "quic hp", AEAD_ALG.key_len())?;
        Self::from_prk(&prk, secret, hp_bytes)
    }

    fn from_prk(prk: &hkdf::Prk, secret: &[u8], hp_bytes: Vec<u8>) -> QuicheResult<Self> {
        let key_bytes = hkdf_expand_label(prk, "quic key", AEAD_ALG.key_len())?;
        let iv_bytes = hkdf_expand_label(prk, "quic iv", 12)?;

        let unbound = UnboundKey::new(AEAD_ALG, &key_bytes)
            .map_err(|_| QuicheError::Crypto("bad aead key length".into()))?;
        let aead = LessSafeKey::new(unbound);
        let hp = HeaderProtectionKey::new(HP_ALG, &hp_bytes)
            .map_err(|_| QuicheError::Crypto("bad header protection key".into()))?;

        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_bytes);

        Ok(Self {
            aead,
            iv,
            hp,
            secret: secret.to_vec(),
            hp_bytes,
        })
    }

    /// Key-phase update / key-epoch ratchet: `next_secret =
    /// HKDF-Expand-Label(secret, "quic ku", "", Hash.len)`. The header
    /// protection key is carried forward unchanged (RFC 9001 §6) rather than
    /// re-derived from `next_secret`, so header unprotect stays valid across
    /// a phase flip regardless of which generation's AEAD key actually
    /// sealed a given packet.
    pub fn next(&self) -> QuicheResult<Self> {
        let prk = hkdf::Prk::new_less_safe(HKDF_SHA256, &self.secret);
        let next_secret = hkdf_expand_label(&prk, "quic ku", self.secret.len())?;
        let next_prk = hkdf::Prk::new_less_safe(HKDF_SHA256, &next_secret);
        Self::from_prk(&next_prk, &next_secret, self.hp_bytes.clone())
    }
}

/// The directional (send + recv) key material for one epoch.
pub struct EpochKeys {
    pub local: PacketKeys,
    pub remote: PacketKeys,
}

/// Derives the Initial-epoch keys from the client's chosen destination CID,
/// per RFC 9001 §5.2. Both endpoints compute the same secrets from the same
/// DCID; `is_client` only selects which derived secret is "local" vs "remote".
pub fn derive_initial_keys(dcid: &[u8], is_client: bool) -> QuicheResult<EpochKeys> {
    let initial_salt = hkdf::Salt::new(HKDF_SHA256, &INITIAL_SALT);
    let initial_secret = initial_salt.extract(dcid);

    let client_secret = hkdf_expand_label(&initial_secret, "client in", 32)?;
    let server_secret = hkdf_expand_label(&initial_secret, "server in", 32)?;

    let client_keys = PacketKeys::from_secret(&client_secret)?;
    let server_keys = PacketKeys::from_secret(&server_secret)?;

    Ok(if is_client {
        EpochKeys {
            local: client_keys,
            remote: server_keys,
        }
    } else {
        EpochKeys {
            local: server_keys,
            remote: client_keys,
        }
    })
}

/// Derives Handshake/Application epoch keys from TLS-exported traffic secrets
/// (the output of the `TlsEndpoint::handshake_step` collaborator, §6).
pub fn derive_epoch_keys(local_secret: &[u8], remote_secret: &[u8]) -> QuicheResult<EpochKeys> {
    Ok(EpochKeys {
        local: PacketKeys::from_secret(local_secret)?,
        remote: PacketKeys::from_secret(remote_secret)?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initial_keys_derive_without_error() {
        let dcid = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];
        let client = derive_initial_keys(&dcid, true).unwrap();
        let server = derive_initial_keys(&dcid, false).unwrap();
        assert_eq!(client.local.iv, server.remote.iv);
        assert_eq!(client.remote.iv, server.local.iv);
    }

    #[test]
    fn key_update_changes_secret() {
        let dcid = [1u8; 8];
        let keys = derive_initial_keys(&dcid, true).unwrap();
        let next = keys.local.next().unwrap();
        assert_ne!(next.iv, keys.local.iv);
    }

    #[test]
    fn key_update_preserves_header_protection_key() {
        let dcid = [2u8; 8];
        let keys = derive_initial_keys(&dcid, true).unwrap();
        let next = keys.local.next().unwrap();
        assert_eq!(next.hp_bytes, keys.local.hp_bytes);
    }
}
