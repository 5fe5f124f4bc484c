//! Operations defined in the management working draft

mod read;

pub use read::{ReadRequest, ReadResponse};
