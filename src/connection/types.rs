/// Which side of the handshake this connection is (§4.3). Determines
/// stream-id parity (`stream::is_client_initiated`), which side owns the
/// ephemeral initial DCID, and the spin-bit copy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Connection lifecycle state (§4.3): `Idle` only applies before the first
/// packet is sent or received; `VersionNegotiation` covers a client's first
/// Initial flight until either a Version Negotiation packet or any other
/// valid response arrives; `Handshake` runs until both sides confirm;
/// `Established` is the steady state; `Closing`/`Draining` implement the
/// close handshake (RFC 9000 §10); `Closed` is terminal and means the
/// connection can be reaped by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    VersionNegotiation,
    Handshake,
    Established,
    Closing,
    Draining,
    Closed,
}

/// Recorded reason for entering `Closing`/`Draining`, kept so a
/// retransmitted CONNECTION_CLOSE (RFC 9000 §10.2 allows resending it on
/// receipt of further packets) carries identical fields every time.
#[derive(Debug, Clone)]
pub struct CloseInfo {
    pub error_code: u64,
    pub frame_type: Option<u64>,
    pub reason: String,
    pub is_app: bool,
    pub initiated_by_us: bool,
}

impl CloseInfo {
    pub fn transport(error_code: u64, frame_type: u64, reason: impl Into<String>, initiated_by_us: bool) -> Self {
        Self { error_code, frame_type: Some(frame_type), reason: reason.into(), is_app: false, initiated_by_us }
    }

    pub fn application(error_code: u64, reason: impl Into<String>, initiated_by_us: bool) -> Self {
        Self { error_code, frame_type: None, reason: reason.into(), is_app: true, initiated_by_us }
    }
}
