use bytes::{Buf, BufMut};

use crate::primitives::cid::{ConnectionId, STATELESS_RESET_TOKEN_LEN};
use crate::primitives::varint::VarInt;
use crate::result::{require, QuicheResult, TransportError};

/// Transport parameter IDs (RFC 9000 §18.2) this crate exchanges during the
/// handshake. Only the subset referenced by the CORE's flow-control, stream-
/// limit, and CID bookkeeping is modeled; unrecognized IDs encountered on
/// decode are skipped rather than rejected, per the RFC's forward-compatible
/// extension rule.
const PARAM_ORIGINAL_DESTINATION_CID: u64 = 0x00;
const PARAM_MAX_IDLE_TIMEOUT: u64 = 0x01;
const PARAM_STATELESS_RESET_TOKEN: u64 = 0x02;
const PARAM_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const PARAM_INITIAL_MAX_DATA: u64 = 0x04;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const PARAM_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const PARAM_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const PARAM_ACK_DELAY_EXPONENT: u64 = 0x0a;
const PARAM_MAX_ACK_DELAY: u64 = 0x0b;
const PARAM_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const PARAM_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const PARAM_INITIAL_SOURCE_CID: u64 = 0x0f;
const PARAM_RETRY_SOURCE_CID: u64 = 0x10;

/// One endpoint's transport parameters (RFC 9000 §18.2), as advertised in
/// the TLS handshake's `quic_transport_parameters` extension. Defaults match
/// the RFC's stated defaults for any parameter the peer omits.
#[derive(Debug, Clone)]
pub struct TransportParameters {
    pub original_destination_cid: Option<ConnectionId>,
    pub max_idle_timeout_ms: u64,
    pub stateless_reset_token: Option<[u8; STATELESS_RESET_TOKEN_LEN]>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay_ms: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub initial_source_cid: Option<ConnectionId>,
    pub retry_source_cid: Option<ConnectionId>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_cid: None,
            max_idle_timeout_ms: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay_ms: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            initial_source_cid: None,
            retry_source_cid: None,
        }
    }
}

fn put_tp_varint(out: &mut Vec<u8>, id: u64, value: u64) {
    let id = VarInt::from_u64_unchecked(id);
    let value = VarInt::from_u64_unchecked(value);
    id.encode(out);
    VarInt::from_u64_unchecked(value.encoded_len() as u64).encode(out);
    value.encode(out);
}

fn put_tp_bytes(out: &mut Vec<u8>, id: u64, data: &[u8]) {
    let id = VarInt::from_u64_unchecked(id);
    id.encode(out);
    VarInt::from_u64_unchecked(data.len() as u64).encode(out);
    out.extend_from_slice(data);
}

fn put_tp_empty(out: &mut Vec<u8>, id: u64) {
    let id = VarInt::from_u64_unchecked(id);
    id.encode(out);
    VarInt::ZERO.encode(out);
}

impl TransportParameters {
    /// Encodes this set as the sequence of (id, length, value) tuples RFC
    /// 9000 §18.1 defines, skipping any field left at its RFC default where
    /// the RFC makes omission equivalent to that default.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();

        if let Some(cid) = &self.original_destination_cid {
            put_tp_bytes(&mut out, PARAM_ORIGINAL_DESTINATION_CID, cid.as_slice());
        }
        if self.max_idle_timeout_ms != 0 {
            put_tp_varint(&mut out, PARAM_MAX_IDLE_TIMEOUT, self.max_idle_timeout_ms);
        }
        if let Some(token) = &self.stateless_reset_token {
            put_tp_bytes(&mut out, PARAM_STATELESS_RESET_TOKEN, token);
        }
        put_tp_varint(&mut out, PARAM_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        put_tp_varint(&mut out, PARAM_INITIAL_MAX_DATA, self.initial_max_data);
        put_tp_varint(&mut out, PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, self.initial_max_stream_data_bidi_local);
        put_tp_varint(&mut out, PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE, self.initial_max_stream_data_bidi_remote);
        put_tp_varint(&mut out, PARAM_INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni);
        put_tp_varint(&mut out, PARAM_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        put_tp_varint(&mut out, PARAM_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        put_tp_varint(&mut out, PARAM_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        put_tp_varint(&mut out, PARAM_MAX_ACK_DELAY, self.max_ack_delay_ms);
        if self.disable_active_migration {
            put_tp_empty(&mut out, PARAM_DISABLE_ACTIVE_MIGRATION);
        }
        put_tp_varint(&mut out, PARAM_ACTIVE_CONNECTION_ID_LIMIT, self.active_connection_id_limit);
        if let Some(cid) = &self.initial_source_cid {
            put_tp_bytes(&mut out, PARAM_INITIAL_SOURCE_CID, cid.as_slice());
        }
        if let Some(cid) = &self.retry_source_cid {
            put_tp_bytes(&mut out, PARAM_RETRY_SOURCE_CID, cid.as_slice());
        }

        out
    }

    /// Decodes a peer's transport parameters. Unrecognized IDs are skipped
    /// by their declared length rather than rejected (RFC 9000 §18.1).
    pub fn decode(mut buf: &[u8]) -> QuicheResult<Self> {
        let mut tp = TransportParameters::default();

        while buf.has_remaining() {
            let id = VarInt::decode(&mut buf)?.into_inner();
            let len = VarInt::decode(&mut buf)?.into_usize()?;
            require(buf.remaining() >= len, TransportError::TransportParameterError, "transport parameter truncated")?;
            let value = &buf[..len];

            match id {
                PARAM_ORIGINAL_DESTINATION_CID => {
                    tp.original_destination_cid = Some(ConnectionId::new(value)?);
                }
                PARAM_MAX_IDLE_TIMEOUT => tp.max_idle_timeout_ms = decode_tp_varint(value)?,
                PARAM_STATELESS_RESET_TOKEN => {
                    require(
                        len == STATELESS_RESET_TOKEN_LEN,
                        TransportError::TransportParameterError,
                        "stateless_reset_token must be 16 bytes",
                    )?;
                    let mut token = [0u8; STATELESS_RESET_TOKEN_LEN];
                    token.copy_from_slice(value);
                    tp.stateless_reset_token = Some(token);
                }
                PARAM_MAX_UDP_PAYLOAD_SIZE => tp.max_udp_payload_size = decode_tp_varint(value)?,
                PARAM_INITIAL_MAX_DATA => tp.initial_max_data = decode_tp_varint(value)?,
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    tp.initial_max_stream_data_bidi_local = decode_tp_varint(value)?
                }
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    tp.initial_max_stream_data_bidi_remote = decode_tp_varint(value)?
                }
                PARAM_INITIAL_MAX_STREAM_DATA_UNI => tp.initial_max_stream_data_uni = decode_tp_varint(value)?,
                PARAM_INITIAL_MAX_STREAMS_BIDI => tp.initial_max_streams_bidi = decode_tp_varint(value)?,
                PARAM_INITIAL_MAX_STREAMS_UNI => tp.initial_max_streams_uni = decode_tp_varint(value)?,
                PARAM_ACK_DELAY_EXPONENT => tp.ack_delay_exponent = decode_tp_varint(value)?,
                PARAM_MAX_ACK_DELAY => tp.max_ack_delay_ms = decode_tp_varint(value)?,
                PARAM_DISABLE_ACTIVE_MIGRATION => tp.disable_active_migration = true,
                PARAM_ACTIVE_CONNECTION_ID_LIMIT => tp.active_connection_id_limit = decode_tp_varint(value)?,
                PARAM_INITIAL_SOURCE_CID => tp.initial_source_cid = Some(ConnectionId::new(value)?),
                PARAM_RETRY_SOURCE_CID => tp.retry_source_cid = Some(ConnectionId::new(value)?),
                _ => {} // forward-compatible: unknown parameters are ignored
            }

            buf.advance(len);
        }

        Ok(tp)
    }
}

fn decode_tp_varint(mut value: &[u8]) -> QuicheResult<u64> {
    let v = VarInt::decode(&mut value)?;
    require(!value.has_remaining(), TransportError::TransportParameterError, "trailing bytes in transport parameter value")?;
    Ok(v.into_inner())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_round_trips() {
        let tp = TransportParameters::default();
        let encoded = tp.encode();
        let decoded = TransportParameters::decode(&encoded).unwrap();
        assert_eq!(decoded.max_udp_payload_size, tp.max_udp_payload_size);
        assert_eq!(decoded.ack_delay_exponent, tp.ack_delay_exponent);
        assert_eq!(decoded.active_connection_id_limit, tp.active_connection_id_limit);
    }

    #[test]
    fn carries_cids_and_flow_control_values() {
        let mut tp = TransportParameters::default();
        tp.initial_source_cid = Some(ConnectionId::new(&[1, 2, 3, 4]).unwrap());
        tp.original_destination_cid = Some(ConnectionId::new(&[9, 9]).unwrap());
        tp.initial_max_data = 1_000_000;
        tp.initial_max_streams_bidi = 100;
        tp.disable_active_migration = true;

        let encoded = tp.encode();
        let decoded = TransportParameters::decode(&encoded).unwrap();

        assert_eq!(decoded.initial_source_cid.unwrap().as_slice(), &[1, 2, 3, 4]);
        assert_eq!(decoded.original_destination_cid.unwrap().as_slice(), &[9, 9]);
        assert_eq!(decoded.initial_max_data, 1_000_000);
        assert_eq!(decoded.initial_max_streams_bidi, 100);
        assert!(decoded.disable_active_migration);
    }

    #[test]
    fn unknown_parameter_id_is_skipped_not_rejected() {
        let mut out = Vec::new();
        put_tp_bytes(&mut out, 0xff00, &[1, 2, 3]);
        put_tp_varint(&mut out, PARAM_INITIAL_MAX_DATA, 42);
        let decoded = TransportParameters::decode(&out).unwrap();
        assert_eq!(decoded.initial_max_data, 42);
    }

    #[test]
    fn rejects_truncated_value() {
        let mut out = Vec::new();
        VarInt::from_u64_unchecked(PARAM_INITIAL_MAX_DATA).encode(&mut out);
        VarInt::from_u64_unchecked(4).encode(&mut out);
        out.push(1); // only one byte instead of the declared 4
        assert!(TransportParameters::decode(&out).is_err());
    }
}
