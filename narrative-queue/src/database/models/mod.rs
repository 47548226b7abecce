//! Database models.

pub mod batch;
pub mod catalogue;
pub mod queue_entry;

pub use batch::*;
pub use catalogue::*;
pub use queue_entry::*;
