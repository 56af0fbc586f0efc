//! Host-facing plumbing: errors, subprocesses, tool lookup and file helpers.

mod error;
mod fsutil;
mod process;
mod toolchain;

pub use error::*;
pub use fsutil::*;
pub use process::*;
pub use toolchain::*;
