//! JSON-over-HTTP transport shared by the live handlers.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::trace;

use super::storage::download_bytes;
use crate::dispatch::ProviderError;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Request headers as name/value pairs.
pub type Headers = Vec<(String, String)>;

pub fn bearer(token: &str) -> (String, String) {
    ("Authorization".to_string(), format!("Bearer {}", token))
}

#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn post_json(&self, url: &str, headers: &Headers, body: &Value) -> ProviderResult<Value>;

    async fn get_json(&self, url: &str, headers: &Headers) -> ProviderResult<Value>;

    async fn get_bytes(&self, url: &str) -> ProviderResult<Bytes>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn header_map(headers: &Headers) -> ProviderResult<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ProviderError::NotConfigured(format!("invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ProviderError::NotConfigured(format!("invalid header value: {}", e)))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    async fn read_json(response: reqwest::Response) -> ProviderResult<Value> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), body));
        }
        parse_body(&body)
    }
}

/// Parse a success body. Anything that is not JSON is malformed.
pub fn parse_body(body: &str) -> ProviderResult<Value> {
    serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        ProviderError::MalformedResponse(format!("{} (body: {})", e, preview))
    })
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn post_json(&self, url: &str, headers: &Headers, body: &Value) -> ProviderResult<Value> {
        trace!(url, "POST");
        let response = self
            .client
            .post(url)
            .headers(Self::header_map(headers)?)
            .json(body)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn get_json(&self, url: &str, headers: &Headers) -> ProviderResult<Value> {
        trace!(url, "GET");
        let response = self
            .client
            .get(url)
            .headers(Self::header_map(headers)?)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn get_bytes(&self, url: &str) -> ProviderResult<Bytes> {
        download_bytes(&self.client, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ErrorClass;

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(r#"{"ok":true}"#).unwrap()["ok"], true);
        let err = parse_body("<html>gateway</html>").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Malformed);
    }

    #[test]
    fn test_header_map() {
        let map = HttpTransport::header_map(&vec![bearer("k")]).unwrap();
        assert_eq!(map.get("authorization").unwrap(), "Bearer k");
        assert!(HttpTransport::header_map(&vec![("bad name".into(), "v".into())]).is_err());
    }
}
