use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use ring::hmac;

use crate::primitives::rand;
use crate::result::{QuicheError, QuicheResult};

/// How long an issued token (Retry or NEW_TOKEN) remains acceptable.
const TOKEN_LIFETIME_SECS: u64 = 10 * 60;

/// One discriminator byte distinguishing the two token kinds this engine
/// issues (§4.6, §6 "token issuance/validation keys for NEW_TOKEN / Retry"),
/// so a Retry token can never be replayed as a post-handshake NEW_TOKEN or
/// vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Retry,
    NewToken,
}

impl TokenKind {
    fn tag(self) -> u8 {
        match self {
            TokenKind::Retry => 0,
            TokenKind::NewToken => 1,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Issues and validates the opaque address-validation tokens carried in
/// Retry packets and NEW_TOKEN frames (§4.6, §6). Tokens are HMAC-tagged
/// rather than encrypted: their payload (kind, timestamp, peer address) is
/// not secret, only unforgeable, so a server that restarts and forgets its
/// key simply starts rejecting old tokens rather than failing open.
pub struct TokenManager {
    key: hmac::Key,
}

impl TokenManager {
    pub fn new() -> Self {
        let mut key_bytes = [0u8; 32];
        rand::fill(&mut key_bytes);
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, &key_bytes),
        }
    }

    /// Issues a token binding `kind` and `peer` to the current time.
    pub fn issue(&self, kind: TokenKind, peer: SocketAddr) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32);
        payload.push(kind.tag());
        payload.extend_from_slice(&now_secs().to_be_bytes());
        encode_addr(&mut payload, peer);

        let tag = hmac::sign(&self.key, &payload);
        let mut token = payload;
        token.extend_from_slice(tag.as_ref());
        token
    }

    /// Validates a previously issued token against the peer address it is
    /// presented from and the expected kind, rejecting forged, expired, or
    /// address-mismatched tokens.
    pub fn validate(&self, token: &[u8], expected_kind: TokenKind, peer: SocketAddr) -> QuicheResult<()> {
        if token.len() < 9 {
            return Err(QuicheError::Crypto("token too short".into()));
        }
        let (payload, tag) = token.split_at(token.len() - 32);
        hmac::verify(&self.key, payload, tag).map_err(|_| QuicheError::Crypto("token HMAC mismatch".into()))?;

        if payload[0] != expected_kind.tag() {
            return Err(QuicheError::Crypto("token kind mismatch".into()));
        }
        let issued_at = u64::from_be_bytes(payload[1..9].try_into().unwrap());
        if now_secs().saturating_sub(issued_at) > TOKEN_LIFETIME_SECS {
            return Err(QuicheError::Crypto("token expired".into()));
        }
        let mut expected_addr = Vec::new();
        encode_addr(&mut expected_addr, peer);
        if payload[9..] != expected_addr[..] {
            return Err(QuicheError::Crypto("token address mismatch".into()));
        }
        Ok(())
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_addr(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            out.push(6);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn issued_token_validates_for_same_peer_and_kind() {
        let mgr = TokenManager::new();
        let peer = addr("127.0.0.1:4433");
        let token = mgr.issue(TokenKind::Retry, peer);
        assert!(mgr.validate(&token, TokenKind::Retry, peer).is_ok());
    }

    #[test]
    fn token_rejected_for_wrong_kind() {
        let mgr = TokenManager::new();
        let peer = addr("127.0.0.1:4433");
        let token = mgr.issue(TokenKind::Retry, peer);
        assert!(mgr.validate(&token, TokenKind::NewToken, peer).is_err());
    }

    #[test]
    fn token_rejected_for_different_peer() {
        let mgr = TokenManager::new();
        let token = mgr.issue(TokenKind::NewToken, addr("127.0.0.1:4433"));
        assert!(mgr.validate(&token, TokenKind::NewToken, addr("127.0.0.1:9999")).is_err());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let mgr = TokenManager::new();
        let peer = addr("127.0.0.1:4433");
        let mut token = mgr.issue(TokenKind::Retry, peer);
        let last = token.len() - 1;
        token[last] ^= 1;
        assert!(mgr.validate(&token, TokenKind::Retry, peer).is_err());
    }
}
