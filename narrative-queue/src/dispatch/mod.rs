//! Provider dispatch: claim loops, retries, polling and rate limits.

pub mod attempt;
pub mod error;
pub mod handler;
pub mod poll;
pub mod rate_limiter;
pub mod registry;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use attempt::{Attempt, AttemptFailure, Decision, RetrySchedule, run_attempts};
pub use error::{ErrorClass, ProviderError, is_content_policy_message};
pub use handler::{JobContext, ProviderHandler};
pub use poll::{PollConfig, PollStatus, poll_until};
pub use rate_limiter::{RateLimiterConfig, RateLimiterManager};
pub use registry::{Dispatcher, LaunchOutcome};
pub use worker::{ProviderWorker, RunSummary, WorkerConfig};

/// Whether handlers call real providers or return canned results.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DispatchMode {
    #[default]
    Live,
    Mock,
}
