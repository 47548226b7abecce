//! Submit-then-poll helper.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::error::{ProviderError, is_content_policy_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Wait before the first status check.
    pub initial_delay_ms: u64,
    /// Wait between status checks.
    pub interval_ms: u64,
    /// Hard cap on status checks.
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            interval_ms: 3_000,
            max_attempts: 60,
        }
    }
}

/// Remote task state reported by one status check.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus<T> {
    Pending,
    /// Finished. `None` means the remote reported success without output.
    Completed(Option<T>),
    Failed(String),
}

/// Poll `check` until the remote task finishes or `max_attempts` is reached.
///
/// A remote failure is terminal (content-filtered if its message says so); a
/// completed-but-empty result is [`ProviderError::EmptyResult`]; running out of
/// attempts is [`ProviderError::PollTimeout`]. Errors from `check` itself are
/// returned as-is.
pub async fn poll_until<T, F, Fut>(config: &PollConfig, mut check: F) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, ProviderError>>,
{
    tokio::time::sleep(Duration::from_millis(config.initial_delay_ms)).await;

    for attempt in 1..=config.max_attempts {
        match check(attempt).await? {
            PollStatus::Completed(Some(value)) => return Ok(value),
            PollStatus::Completed(None) => return Err(ProviderError::EmptyResult),
            PollStatus::Failed(message) => {
                if is_content_policy_message(&message) {
                    return Err(ProviderError::ContentPolicy(message));
                }
                return Err(ProviderError::PollFailed(message));
            }
            PollStatus::Pending => {
                trace!(attempt, max = config.max_attempts, "Remote task still pending");
                if attempt < config.max_attempts {
                    tokio::time::sleep(Duration::from_millis(config.interval_ms)).await;
                }
            }
        }
    }

    Err(ProviderError::PollTimeout {
        attempts: config.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(max_attempts: u32) -> PollConfig {
        PollConfig {
            initial_delay_ms: 1,
            interval_ms: 1,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_completes_after_pending() {
        let value = poll_until(&fast(5), |attempt| async move {
            if attempt < 3 {
                Ok(PollStatus::Pending)
            } else {
                Ok(PollStatus::Completed(Some(attempt)))
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_timeout_after_max_attempts() {
        let err = poll_until::<(), _, _>(&fast(3), |_| async { Ok(PollStatus::Pending) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::PollTimeout { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_empty_and_failed_are_terminal() {
        let err = poll_until::<String, _, _>(&fast(3), |_| async { Ok(PollStatus::Completed(None)) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::EmptyResult));

        let err = poll_until::<String, _, _>(&fast(3), |_| async {
            Ok(PollStatus::Failed("worker crashed".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::PollFailed(_)));

        let err = poll_until::<String, _, _>(&fast(3), |_| async {
            Ok(PollStatus::Failed("blocked by NSFW filter".to_string()))
        })
        .await
        .unwrap_err();
        assert!(err.is_content_policy());
    }
}
