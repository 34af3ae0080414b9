use crate::crypto::keys::Epoch;
use crate::result::QuicheResult;

/// Output of one `handshake_step`: bytes to emit as outbound CRYPTO frames in
/// the same epoch, freshly exported secrets when the epoch's keys become
/// available, and whether the local handshake has now fully completed.
pub struct HandshakeStep {
    pub output_crypto: Vec<u8>,
    pub new_secrets: Option<EpochSecrets>,
    pub done: bool,
}

/// A pair of traffic secrets for one epoch, as exported by the TLS engine
/// per §6 (`secrets(epoch) -> (aead_key, iv, hp_key)`). We export the raw
/// secret rather than derived key material — derivation is this crate's job
/// (`crypto::keys::derive_epoch_keys`), keeping the boundary at "TLS produces
/// secrets, QUIC derives packet keys from them" as RFC 9001 specifies.
#[derive(Clone)]
pub struct EpochSecrets {
    pub epoch: Epoch,
    pub local: Vec<u8>,
    pub remote: Vec<u8>,
}

/// The TLS 1.3-equivalent handshake engine this crate treats as an external
/// collaborator (§1, §6). It consumes CRYPTO frame payloads per epoch and
/// emits CRYPTO frame payloads plus key material in return. A production
/// embedder plugs in a real TLS stack (e.g. `rustls`) behind this trait; the
/// `StubTlsEndpoint` below is a minimal deterministic implementation that
/// lets the connection state machine and its tests exercise epoch
/// progression without a real certificate chain.
pub trait TlsEndpoint: Send {
    /// Feeds `input_crypto` (bytes received in CRYPTO frames at `epoch`) to
    /// the handshake engine and returns what, if anything, to send back.
    fn handshake_step(&mut self, epoch: Epoch, input_crypto: &[u8]) -> QuicheResult<HandshakeStep>;

    /// True once the engine has produced its first flight without having
    /// received any input — used to kick off a client handshake.
    fn is_client(&self) -> bool;
}

/// Deterministic stand-in for a TLS 1.3 handshake: each side sends a fixed
/// "hello" message at Initial, then immediately exports Handshake and
/// Application secrets and reports completion. This reproduces the *shape*
/// of a TLS handshake (epoch-ordered CRYPTO exchange, secret export,
/// completion signal) without implementing transcript hashing, certificate
/// validation, or any actual key exchange.
pub struct StubTlsEndpoint {
    is_client: bool,
    step: u8,
}

impl StubTlsEndpoint {
    pub fn new(is_client: bool) -> Self {
        Self { is_client, step: 0 }
    }

    fn derive_stub_secret(&self, epoch: Epoch, local: bool) -> Vec<u8> {
        // Not a real key schedule: a fixed-length byte string distinguishing
        // direction and epoch, sufficient to drive `derive_epoch_keys`.
        let tag = if self.is_client == local { "c" } else { "s" };
        let mut secret = vec![0u8; 32];
        secret[0] = epoch as u8;
        secret[1] = tag.as_bytes()[0];
        secret
    }
}

impl TlsEndpoint for StubTlsEndpoint {
    fn handshake_step(&mut self, epoch: Epoch, input_crypto: &[u8]) -> QuicheResult<HandshakeStep> {
        match (self.is_client, self.step) {
            (true, 0) => {
                self.step = 1;
                Ok(HandshakeStep {
                    output_crypto: b"client hello".to_vec(),
                    new_secrets: None,
                    done: false,
                })
            }
            (true, 1) if epoch == Epoch::Handshake && !input_crypto.is_empty() => {
                self.step = 2;
                Ok(HandshakeStep {
                    output_crypto: b"client finished".to_vec(),
                    new_secrets: Some(EpochSecrets {
                        epoch: Epoch::Handshake,
                        local: self.derive_stub_secret(Epoch::Handshake, true),
                        remote: self.derive_stub_secret(Epoch::Handshake, false),
                    }),
                    done: false,
                })
            }
            (true, 2) => {
                self.step = 3;
                Ok(HandshakeStep {
                    output_crypto: Vec::new(),
                    new_secrets: Some(EpochSecrets {
                        epoch: Epoch::Application,
                        local: self.derive_stub_secret(Epoch::Application, true),
                        remote: self.derive_stub_secret(Epoch::Application, false),
                    }),
                    done: true,
                })
            }
            (false, 0) if epoch == Epoch::Initial && !input_crypto.is_empty() => {
                self.step = 1;
                Ok(HandshakeStep {
                    output_crypto: b"server hello".to_vec(),
                    new_secrets: Some(EpochSecrets {
                        epoch: Epoch::Handshake,
                        local: self.derive_stub_secret(Epoch::Handshake, true),
                        remote: self.derive_stub_secret(Epoch::Handshake, false),
                    }),
                    done: false,
                })
            }
            (false, 1) if epoch == Epoch::Handshake && !input_crypto.is_empty() => {
                self.step = 2;
                Ok(HandshakeStep {
                    output_crypto: Vec::new(),
                    new_secrets: Some(EpochSecrets {
                        epoch: Epoch::Application,
                        local: self.derive_stub_secret(Epoch::Application, true),
                        remote: self.derive_stub_secret(Epoch::Application, false),
                    }),
                    done: true,
                })
            }
            _ => Ok(HandshakeStep {
                output_crypto: Vec::new(),
                new_secrets: None,
                done: false,
            }),
        }
    }

    fn is_client(&self) -> bool {
        self.is_client
    }
}
