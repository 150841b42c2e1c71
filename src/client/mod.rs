//! External-dependency guards: circuit breakers, automation sessions and
//! their lifecycle tracking.

mod breaker;
mod session;
mod tracker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use breaker::*;
pub use session::*;
pub use tracker::*;
