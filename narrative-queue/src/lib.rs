//! narrative-queue library crate.
//!
//! Job queue, provider dispatch, batch aggregation and pipeline progress
//! for generated audiobook visuals. The binary wires these into an admin
//! HTTP server and a worker host.

pub mod api;
pub mod batch;
pub mod checkup;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod logging;
pub mod progress;
pub mod providers;
pub mod queue;
pub mod utils;

pub use error::{Error, Result};
