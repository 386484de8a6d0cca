//! Types shared by the master, the chunkservers and clients.

mod clock;
mod common;
mod error;
pub mod rpc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use common::*;
pub use error::{GfsError, Result};
