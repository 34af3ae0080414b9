use serde::{Deserialize, Serialize};

/// Per-connection configuration (§6 "Connection configuration"). Defaults
/// match the values this crate assumes when an embedder doesn't override
/// them, not necessarily RFC 9000's wire defaults (those live on
/// `TransportParameters::default`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub idle_timeout_s: u64,
    pub enable_spinbit: bool,
    pub enable_0rtt: bool,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
    pub alpn_list: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_s: 10,
            enable_spinbit: true,
            enable_0rtt: false,
            initial_max_data: 10 * 1024 * 1024,
            initial_max_stream_data: 1024 * 1024,
            max_streams_bidi: 100,
            max_streams_uni: 100,
            alpn_list: Vec::new(),
        }
    }
}

/// Process-wide engine configuration (§4.6, §6 `engine_init`). `num_bufs`
/// sizes both the buffer pool and the parallel packet-metadata array (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub num_bufs: usize,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub local_cid_len: usize,
    pub max_datagram_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_bufs: 100_000,
            cert_path: None,
            key_path: None,
            local_cid_len: 8,
            max_datagram_size: crate::packet::codec::MAX_DATAGRAM_SIZE,
        }
    }
}

impl EngineConfig {
    /// Servers default to an 8-byte issued CID (§6); clients to 4.
    pub fn client_default() -> Self {
        Self { local_cid_len: 4, ..Self::default() }
    }
}
