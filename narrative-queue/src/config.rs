//! Engine configuration loaded from environment variables.
//!
//! Every value is optional. Unparseable values log a warning and keep the
//! default.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use strum::IntoEnumIterator;
use tracing::warn;

use crate::api::server::ApiServerConfig;
use crate::batch::WebhookConfig;
use crate::database::default_pool_size;
use crate::database::models::ProviderKind;
use crate::dispatch::{DispatchMode, PollConfig, RateLimiterConfig, RateLimiterManager, RetrySchedule, WorkerConfig};
use crate::domain::RetryPolicy;
use crate::progress::ProgressWeights;

/// Source of configuration values, keyed by variable name.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

fn non_empty(source: &dyn ConfigSource, key: &str) -> Option<String> {
    source
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn parse_or<T>(source: &dyn ConfigSource, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = non_empty(source, key) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(e) => {
            warn!(key, value = %raw, "Invalid configuration value, using default: {}", e);
            default
        }
    }
}

fn parse_bool_or(source: &dyn ConfigSource, key: &str, default: bool) -> bool {
    let Some(raw) = non_empty(source, key) else {
        return default;
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(key, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}

/// Connection settings for one provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Requests per second. `None` means unlimited.
    pub rps: Option<f64>,
}

impl ProviderConfig {
    /// Built-in endpoint and model for providers with a public API.
    pub fn defaults_for(provider: ProviderKind) -> Self {
        let (base_url, model) = match provider {
            ProviderKind::OpenAi => (Some("https://api.openai.com/v1"), Some("gpt-4o-mini")),
            ProviderKind::Dalle => (Some("https://api.openai.com/v1"), Some("dall-e-3")),
            ProviderKind::Gemini => (
                Some("https://generativelanguage.googleapis.com/v1beta"),
                Some("gemini-1.5-flash"),
            ),
            ProviderKind::Stability => (Some("https://api.stability.ai/v2beta"), None),
            ProviderKind::Wavespeed => (
                Some("https://api.wavespeed.ai/api/v3"),
                Some("wavespeed-ai/flux-dev"),
            ),
            ProviderKind::Modal | ProviderKind::Transcription | ProviderKind::BookImport => (None, None),
        };
        Self {
            base_url: base_url.map(str::to_string),
            model: model.map(str::to_string),
            ..Default::default()
        }
    }

    fn load(source: &dyn ConfigSource, provider: ProviderKind) -> Self {
        let prefix = provider.env_prefix();
        let mut config = Self::defaults_for(provider);
        if let Some(url) = non_empty(source, &format!("{}_BASE_URL", prefix)) {
            config.base_url = Some(url.trim_end_matches('/').to_string());
        }
        config.api_key = non_empty(source, &format!("{}_API_KEY", prefix));
        if let Some(model) = non_empty(source, &format!("{}_MODEL", prefix)) {
            config.model = Some(model);
        }

        let rps_key = format!("{}_RPS", prefix);
        if let Some(raw) = non_empty(source, &rps_key) {
            match raw.parse::<f64>() {
                Ok(rps) if rps.is_finite() && rps > 0.0 => config.rps = Some(rps),
                _ => warn!(key = %rps_key, value = %raw, "Invalid rate limit, provider stays unlimited"),
            }
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub durable_root: String,
    pub durable_base_url: String,
    pub cdn_root: String,
    pub cdn_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            durable_root: "./data/durable".to_string(),
            durable_base_url: "http://localhost:12600/media".to_string(),
            cdn_root: "./data/cdn".to_string(),
            cdn_base_url: "http://localhost:12600/cdn".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub filter: String,
    pub json: bool,
    /// Directory for the daily rolling log file. Console only when unset.
    pub dir: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: crate::logging::DEFAULT_FILTER.to_string(),
            json: false,
            dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    pub worker: WorkerConfig,
    pub poll: PollConfig,
    /// Providers whose background loop starts with the process.
    pub autostart: Vec<ProviderKind>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Live,
            worker: WorkerConfig::default(),
            poll: PollConfig::default(),
            autostart: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub api: ApiServerConfig,
    /// Bearer token required by administrative routes. They are disabled when unset.
    pub admin_token: Option<String>,
    pub dispatch: DispatchConfig,
    pub contention: RetryPolicy,
    pub weights: ProgressWeights,
    pub checkup_stuck_after: Duration,
    pub storage: StorageConfig,
    pub webhook: WebhookConfig,
    pub providers: HashMap<ProviderKind, ProviderConfig>,
    pub logging: LogSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:narrative-queue.db?mode=rwc".to_string(),
            database_max_connections: default_pool_size(),
            api: ApiServerConfig::default(),
            admin_token: None,
            dispatch: DispatchConfig::default(),
            contention: RetryPolicy::contention(),
            weights: ProgressWeights::default(),
            checkup_stuck_after: Duration::from_secs(15 * 60),
            storage: StorageConfig::default(),
            webhook: WebhookConfig::default(),
            providers: ProviderKind::iter()
                .map(|p| (p, ProviderConfig::defaults_for(p)))
                .collect(),
            logging: LogSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env_or_default() -> Self {
        Self::from_source(&EnvSource)
    }

    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let defaults = Self::default();

        let database_url = non_empty(source, "DATABASE_URL").unwrap_or(defaults.database_url);
        let database_max_connections =
            parse_or(source, "DATABASE_MAX_CONNECTIONS", defaults.database_max_connections);

        let worker_defaults = defaults.dispatch.worker.clone();
        let worker = WorkerConfig {
            claim_limit: parse_or(source, "DISPATCH_CLAIM_LIMIT", worker_defaults.claim_limit).max(1),
            concurrency: parse_or(source, "DISPATCH_CONCURRENCY", worker_defaults.concurrency).max(1),
            poll_interval: Duration::from_millis(parse_or(
                source,
                "DISPATCH_POLL_INTERVAL_MS",
                worker_defaults.poll_interval.as_millis() as u64,
            )),
            retry: RetrySchedule {
                max_attempts: worker_defaults.retry.max_attempts,
                transient_backoff: Duration::from_millis(parse_or(
                    source,
                    "DISPATCH_RETRY_BACKOFF_MS",
                    worker_defaults.retry.transient_backoff.as_millis() as u64,
                )),
            },
            requeue_failed: parse_bool_or(source, "DISPATCH_REQUEUE_FAILED", worker_defaults.requeue_failed),
        };

        let autostart = non_empty(source, "DISPATCH_AUTOSTART")
            .map(|raw| parse_provider_list(&raw))
            .unwrap_or_default();

        let dispatch = DispatchConfig {
            mode: parse_or(source, "DISPATCH_MODE", defaults.dispatch.mode),
            worker,
            poll: defaults.dispatch.poll,
            autostart,
        };

        let contention = RetryPolicy {
            max_retries: parse_or(source, "CONTENTION_MAX_RETRIES", defaults.contention.max_retries),
            initial_delay_ms: parse_or(
                source,
                "CONTENTION_BASE_DELAY_MS",
                defaults.contention.initial_delay_ms,
            ),
            max_delay_ms: parse_or(source, "CONTENTION_MAX_DELAY_MS", defaults.contention.max_delay_ms),
            ..defaults.contention
        };

        let transcription_weight =
            parse_or(source, "TRANSCRIPTION_WEIGHT", defaults.weights.transcription_weight);
        let graph_weight = parse_or(source, "GRAPH_WEIGHT", defaults.weights.graph_weight);
        let weights = match defaults
            .weights
            .clone()
            .with_phase_weights(transcription_weight, graph_weight)
        {
            Ok(weights) => weights,
            Err(e) => {
                warn!("{}, using default weights", e);
                defaults.weights
            }
        };

        let storage = StorageConfig {
            durable_root: non_empty(source, "STORAGE_DURABLE_ROOT").unwrap_or(defaults.storage.durable_root),
            durable_base_url: non_empty(source, "STORAGE_DURABLE_BASE_URL")
                .unwrap_or(defaults.storage.durable_base_url),
            cdn_root: non_empty(source, "STORAGE_CDN_ROOT").unwrap_or(defaults.storage.cdn_root),
            cdn_base_url: non_empty(source, "STORAGE_CDN_BASE_URL").unwrap_or(defaults.storage.cdn_base_url),
        };

        let webhook = WebhookConfig {
            bearer_token: non_empty(source, "WEBHOOK_BEARER_TOKEN"),
            timeout_secs: parse_or(source, "WEBHOOK_TIMEOUT_SECS", defaults.webhook.timeout_secs),
            ..defaults.webhook
        };

        let providers = ProviderKind::iter()
            .map(|p| (p, ProviderConfig::load(source, p)))
            .collect();

        let logging = LogSettings {
            filter: non_empty(source, "LOG_FILTER").unwrap_or(defaults.logging.filter),
            json: parse_bool_or(source, "LOG_JSON", defaults.logging.json),
            dir: non_empty(source, "LOG_DIR"),
        };

        Self {
            database_url,
            database_max_connections,
            api: ApiServerConfig::from_source(source),
            admin_token: non_empty(source, "ADMIN_TOKEN"),
            dispatch,
            contention,
            weights,
            checkup_stuck_after: Duration::from_secs(parse_or(
                source,
                "CHECKUP_STUCK_AFTER_SECS",
                defaults.checkup_stuck_after.as_secs(),
            )),
            storage,
            webhook,
            providers,
            logging,
        }
    }

    pub fn provider(&self, provider: ProviderKind) -> ProviderConfig {
        self.providers
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| ProviderConfig::defaults_for(provider))
    }

    /// Token buckets for every provider with a configured rate.
    pub fn rate_limiter(&self) -> RateLimiterManager {
        let mut manager = RateLimiterManager::new();
        for (provider, config) in &self.providers {
            let Some(rps) = config.rps else { continue };
            match RateLimiterConfig::with_rps(rps) {
                Ok(limit) => manager.set_config(*provider, limit),
                Err(e) => warn!(%provider, "Ignoring rate limit: {}", e),
            }
        }
        manager
    }
}

fn parse_provider_list(raw: &str) -> Vec<ProviderKind> {
    if raw.trim().eq_ignore_ascii_case("all") {
        return ProviderKind::iter().collect();
    }
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|name| match ProviderKind::parse(name) {
            Some(provider) => Some(provider),
            None => {
                warn!(provider = name, "Unknown provider in DISPATCH_AUTOSTART");
                None
            }
        })
        .collect()
}
