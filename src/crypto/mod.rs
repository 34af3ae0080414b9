pub mod aead;
pub mod header_protection;
pub mod keys;
pub mod retry;
pub mod tls;

pub use keys::{derive_epoch_keys, derive_initial_keys, Epoch, EpochKeys, PacketKeys};
pub use tls::{EpochSecrets, HandshakeStep, StubTlsEndpoint, TlsEndpoint};
