use thiserror::Error;

/// Transport-level error codes from the QUIC wire format (RFC 9000 §20.1).
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    NoError = 0x00,
    InternalError = 0x01,
    ConnectionRefused = 0x02,
    FlowControlError = 0x03,
    StreamLimitError = 0x04,
    StreamStateError = 0x05,
    FinalSizeError = 0x06,
    FrameEncodingError = 0x07,
    TransportParameterError = 0x08,
    ConnectionIdLimitError = 0x09,
    ProtocolViolation = 0x0a,
    InvalidToken = 0x0b,
    ApplicationError = 0x0c,
    CryptoBufferExceeded = 0x0d,
    KeyUpdateError = 0x0e,
    AeadLimitReached = 0x0f,
    NoViablePath = 0x10,
}

impl TransportError {
    pub fn code(self) -> u64 {
        self as u64
    }

    /// `0x0100..=0x01ff` is reserved for `CRYPTO_ERROR`, carrying the TLS alert
    /// in the low byte. Kept as a free function rather than a variant since the
    /// alert byte is produced by the TLS collaborator, not by this crate.
    pub fn crypto_error(tls_alert: u8) -> u64 {
        0x0100 | tls_alert as u64
    }
}

/// The crate-wide error type. Every fallible operation in the CORE returns
/// this; per the spec's propagation policy, protocol-level failures never
/// unwind out of band — they are captured as a `QuicheError` and turned into
/// a state transition (close/drain) by the caller, not raised as a panic.
#[derive(Debug, Error)]
pub enum QuicheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport protocol violation ({code:?}): {msg}")]
    Transport { code: TransportError, msg: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    Other(String),
}

pub type QuicheResult<T> = Result<T, QuicheError>;

impl QuicheError {
    pub fn protocol(code: TransportError, msg: impl Into<String>) -> Self {
        QuicheError::Transport {
            code,
            msg: msg.into(),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for QuicheError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        QuicheError::Other(err.to_string())
    }
}

pub fn require(cond: bool, code: TransportError, msg: &str) -> QuicheResult<()> {
    if !cond {
        return Err(QuicheError::protocol(code, msg));
    }
    Ok(())
}
