mod cid_set;
mod connection;
mod types;

pub use cid_set::CidSet;
pub use connection::Connection;
pub use types::{CloseInfo, ConnState, Role};
