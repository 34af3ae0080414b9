use crate::primitives::cid::{ConnectionId, IssuedCid, STATELESS_RESET_TOKEN_LEN};
use crate::result::{require, QuicheResult, TransportError};

/// The ordered set of connection identifiers one side maintains for one
/// direction (§3 "Connection Identifier"): `local` instances are the CIDs we
/// issue via NEW_CONNECTION_ID and advertise for the peer to use as outer
/// packet destination; `remote` instances are what the peer issued to us.
/// Both share the same bookkeeping — sequence numbers, retirement, a single
/// active member — so one type serves both roles.
#[derive(Debug)]
pub struct CidSet {
    cids: Vec<IssuedCid>,
    next_seq: u64,
    active_seq: u64,
    retire_prior_to: u64,
}

impl CidSet {
    /// Seeds the set with the CID used before any NEW_CONNECTION_ID frame is
    /// exchanged (the initial scid/dcid negotiated during the handshake).
    pub fn new(initial: ConnectionId, reset_token: Option<[u8; STATELESS_RESET_TOKEN_LEN]>) -> Self {
        Self {
            cids: vec![IssuedCid::new(0, initial, reset_token)],
            next_seq: 1,
            active_seq: 0,
            retire_prior_to: 0,
        }
    }

    pub fn active(&self) -> &ConnectionId {
        self.cids
            .iter()
            .find(|c| c.seq == self.active_seq)
            .map(|c| &c.cid)
            .expect("active_seq always names a live entry")
    }

    pub fn active_reset_token(&self) -> Option<&[u8; STATELESS_RESET_TOKEN_LEN]> {
        self.cids.iter().find(|c| c.seq == self.active_seq).and_then(|c| c.reset_token.as_ref())
    }

    /// Allocates the next sequence number for a CID we are about to issue
    /// (local sets only).
    pub fn next_local_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Records a CID issued under `seq` (local: one we generated ourselves;
    /// remote: one the peer sent in a NEW_CONNECTION_ID frame). Invariant
    /// (§3): sequence numbers strictly increase per direction.
    pub fn insert(&mut self, seq: u64, cid: ConnectionId, reset_token: Option<[u8; STATELESS_RESET_TOKEN_LEN]>) -> QuicheResult<()> {
        require(
            !self.cids.iter().any(|c| c.seq == seq),
            TransportError::ProtocolViolation,
            "connection id sequence number reused",
        )?;
        if seq >= self.next_seq {
            self.next_seq = seq + 1;
        }
        self.cids.push(IssuedCid::new(seq, cid, reset_token));
        Ok(())
    }

    pub fn find_by_value(&self, cid: &ConnectionId) -> Option<&IssuedCid> {
        self.cids.iter().find(|c| &c.cid == cid)
    }

    /// Applies a peer's `retire_prior_to` threshold (carried on every
    /// NEW_CONNECTION_ID frame): every non-retired CID with a lower sequence
    /// number must now be retired, and the caller must emit
    /// RETIRE_CONNECTION_ID for the returned sequence numbers.
    pub fn retire_below(&mut self, retire_prior_to: u64) -> Vec<u64> {
        if retire_prior_to <= self.retire_prior_to {
            return Vec::new();
        }
        self.retire_prior_to = retire_prior_to;
        let mut newly_retired = Vec::new();
        for c in self.cids.iter_mut() {
            if c.seq < retire_prior_to && !c.retired {
                c.retired = true;
                newly_retired.push(c.seq);
            }
        }
        if self.active_seq < retire_prior_to {
            if let Some(next) = self.cids.iter().filter(|c| !c.retired).map(|c| c.seq).min() {
                self.active_seq = next;
            }
        }
        newly_retired
    }

    /// Marks `seq` retired (the local side decided to rotate away from it, or
    /// a RETIRE_CONNECTION_ID from the peer named it). A retired CID is only
    /// dropped from the set — per §3's invariant — once the corresponding
    /// RETIRE_CONNECTION_ID has itself been acknowledged; callers track that
    /// via `drop_acked`.
    pub fn retire(&mut self, seq: u64) {
        if let Some(c) = self.cids.iter_mut().find(|c| c.seq == seq) {
            c.retired = true;
        }
        if self.active_seq == seq {
            if let Some(next) = self.cids.iter().filter(|c| !c.retired).map(|c| c.seq).min() {
                self.active_seq = next;
            }
        }
    }

    /// Drops a retired CID once its RETIRE_CONNECTION_ID has been acked.
    pub fn drop_acked(&mut self, seq: u64) {
        self.cids.retain(|c| !(c.seq == seq && c.retired));
    }

    pub fn len(&self) -> usize {
        self.cids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IssuedCid> {
        self.cids.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retire_below_threshold_retires_and_rotates_active() {
        let mut set = CidSet::new(ConnectionId::new(&[0]).unwrap(), None);
        set.insert(1, ConnectionId::new(&[1]).unwrap(), None).unwrap();
        set.insert(2, ConnectionId::new(&[2]).unwrap(), None).unwrap();

        let retired = set.retire_below(2);
        assert_eq!(retired, vec![0, 1]);
        assert_eq!(set.active().as_slice(), &[2]);
    }

    #[test]
    fn sequence_reuse_is_rejected() {
        let mut set = CidSet::new(ConnectionId::new(&[0]).unwrap(), None);
        assert!(set.insert(0, ConnectionId::new(&[9]).unwrap(), None).is_err());
    }

    #[test]
    fn drop_acked_removes_only_retired_entries() {
        let mut set = CidSet::new(ConnectionId::new(&[0]).unwrap(), None);
        set.insert(1, ConnectionId::new(&[1]).unwrap(), None).unwrap();
        set.retire(0);
        set.drop_acked(1); // not retired: no-op
        assert_eq!(set.len(), 2);
        set.drop_acked(0);
        assert_eq!(set.len(), 1);
    }
}
