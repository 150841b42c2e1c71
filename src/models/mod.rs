//! Core data models for harvester.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants and unit outcomes

mod config;
mod error;
mod run;

pub use config::*;
pub use error::*;
pub use run::*;
