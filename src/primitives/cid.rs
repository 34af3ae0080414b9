use std::fmt;

use crate::result::{require, QuicheResult, TransportError};

pub const MAX_CID_LEN: usize = 20;
pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

/// An opaque connection identifier, up to 20 bytes, as carried in packet
/// headers. `ConnectionId` is the bare wire value; `IssuedCid` (below) adds the
/// sequence number and retirement bookkeeping the CID data model in the spec
/// requires.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> QuicheResult<Self> {
        require(
            bytes.len() <= MAX_CID_LEN,
            TransportError::ProtocolViolation,
            "connection id exceeds 20 bytes",
        )?;
        let mut buf = [0u8; MAX_CID_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            len: bytes.len() as u8,
            bytes: buf,
        })
    }

    pub fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0; MAX_CID_LEN],
        }
    }

    pub fn random(len: usize) -> Self {
        Self::new(&super::rand::bytes(len)).expect("len <= MAX_CID_LEN checked by caller")
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid(")?;
        for b in self.as_slice() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A CID as tracked by the CID data model in §3: carries the sequence number
/// it was issued under, an optional stateless-reset token, and retirement
/// state. `local` sets (CIDs we advertise) always carry a reset token; peer-
/// issued (`remote`) sets carry whatever the NEW_CONNECTION_ID frame sent.
#[derive(Clone, Debug)]
pub struct IssuedCid {
    pub seq: u64,
    pub cid: ConnectionId,
    pub reset_token: Option<[u8; STATELESS_RESET_TOKEN_LEN]>,
    pub retired: bool,
}

impl IssuedCid {
    pub fn new(seq: u64, cid: ConnectionId, reset_token: Option<[u8; STATELESS_RESET_TOKEN_LEN]>) -> Self {
        Self {
            seq,
            cid,
            reset_token,
            retired: false,
        }
    }
}
