//! Batch progress aggregation and completion delivery.

pub mod aggregator;
pub mod webhook;

pub use aggregator::BatchAggregator;
pub use webhook::{CompletionNotifier, LoggingNotifier, WebhookConfig, WebhookNotifier};
