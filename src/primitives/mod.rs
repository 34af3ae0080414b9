pub mod cid;
pub mod rand;
pub mod varint;

pub use cid::*;
pub use rand::*;
pub use varint::*;
