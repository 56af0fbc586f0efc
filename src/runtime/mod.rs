mod perf_resolve;
mod runner;
mod steps;

pub use perf_resolve::*;
pub use runner::*;
pub use steps::*;
