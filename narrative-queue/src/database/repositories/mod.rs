//! Repository layer for database access.
//!
//! Each store concern gets a trait plus a SQLx implementation, so services
//! can be tested against the real schema or swapped for fakes.

pub mod batch;
pub mod catalogue;
pub mod queue;

pub use batch::*;
pub use catalogue::*;
pub use queue::*;
