//! profsession core library: session configuration, the profiling step table
//! and the runner that executes it.

mod archive;
mod config;
mod platform;
mod report;
mod runtime;
mod session;

pub use archive::*;
pub use config::*;
pub use platform::*;
pub use report::*;
pub use runtime::*;
pub use session::*;
