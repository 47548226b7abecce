//! Storage collaborator: object stores, dual upload, downloads, JSON documents.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::dispatch::ProviderError;
use crate::domain::RetryPolicy;
use crate::{Error, Result};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    /// Store `bytes` under `key` and return its public URL.
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<String>;

    /// Read `key`. `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
}

/// Object store backed by a local directory, served under `base_url`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    name: String,
    root: PathBuf,
    base_url: String,
}

impl LocalObjectStore {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::storage(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, bytes: Bytes, _content_type: &str) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Readers never see a partial object.
        let mut temp_path = path.clone().into_os_string();
        temp_path.push(".tmp");
        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!(store = %self.name, key, size = bytes.len(), "Stored object");
        Ok(self.url_for(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedMedia {
    pub durable_url: String,
    pub cdn_url: String,
}

/// Uploads generated media to durable storage and the CDN mirror.
#[derive(Clone)]
pub struct MediaUploader {
    durable: Arc<dyn ObjectStore>,
    cdn: Arc<dyn ObjectStore>,
}

impl MediaUploader {
    pub fn new(durable: Arc<dyn ObjectStore>, cdn: Arc<dyn ObjectStore>) -> Self {
        Self { durable, cdn }
    }

    /// Upload to both destinations in parallel. Fails if either upload fails.
    pub async fn upload(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<UploadedMedia> {
        let (durable_url, cdn_url) = tokio::try_join!(
            self.durable.put(key, bytes.clone(), content_type),
            self.cdn.put(key, bytes, content_type),
        )?;
        Ok(UploadedMedia {
            durable_url,
            cdn_url,
        })
    }
}

/// Fetch `url` into memory.
pub async fn download_bytes(client: &reqwest::Client, url: &str) -> std::result::Result<Bytes, ProviderError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(status.as_u16(), body));
    }
    Ok(response.bytes().await?)
}

async fn with_retries<T, F, Fut>(op_name: &str, key: &str, policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(key, attempt = attempt + 1, ?delay, "{} failed, retrying: {}", op_name, e);
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read a JSON document, retrying store failures under `policy`.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    key: &str,
    policy: &RetryPolicy,
) -> Result<Option<T>> {
    let Some(bytes) = with_retries("JSON read", key, policy, || store.get(key)).await? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Write a JSON document, retrying store failures under `policy`.
pub async fn write_json<T: Serialize + Sync>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
    policy: &RetryPolicy,
) -> Result<String> {
    let bytes = Bytes::from(serde_json::to_vec(value)?);
    with_retries("JSON write", key, policy, || {
        store.put(key, bytes.clone(), "application/json")
    })
    .await
}
