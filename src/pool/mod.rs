//! Bounded concurrent execution of a step's units.

mod attempt;
mod worker;

pub use attempt::*;
pub use worker::*;
