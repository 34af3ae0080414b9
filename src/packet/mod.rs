pub mod codec;
pub mod frame;
pub mod header;
pub mod types;

pub use types::*;
