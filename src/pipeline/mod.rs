//! Pipeline module - ordered steps, lifecycle hooks and the run executor.

mod executor;
mod hooks;
mod step;

pub use executor::*;
pub use hooks::*;
pub use step::*;
