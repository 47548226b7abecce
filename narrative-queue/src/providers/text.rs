//! LLM completions: OpenAI chat-completions and Gemini generateContent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::http::{Headers, ProviderTransport, bearer};
use crate::config::ProviderConfig;
use crate::database::models::{EntryType, ProviderKind};
use crate::dispatch::{JobContext, ProviderError, ProviderHandler};
use crate::queue::{JobParams, TextParams};

type ProviderResult<T> = std::result::Result<T, ProviderError>;

pub struct TextGenerationHandler {
    provider: ProviderKind,
    config: ProviderConfig,
    transport: Arc<dyn ProviderTransport>,
}

impl TextGenerationHandler {
    pub fn new(provider: ProviderKind, config: ProviderConfig, transport: Arc<dyn ProviderTransport>) -> Self {
        Self {
            provider,
            config,
            transport,
        }
    }

    fn endpoint(&self) -> ProviderResult<(&str, &str)> {
        let base = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured(format!("{} base URL", self.provider)))?;
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured(format!("{} API key", self.provider)))?;
        Ok((base, key))
    }

    fn model<'a>(&'a self, params: &'a TextParams) -> ProviderResult<&'a str> {
        params
            .model
            .as_deref()
            .or(self.config.model.as_deref())
            .ok_or_else(|| ProviderError::NotConfigured(format!("{} model", self.provider)))
    }

    async fn openai(&self, params: &TextParams) -> ProviderResult<(String, String)> {
        let (base, key) = self.endpoint()?;
        let model = self.model(params)?;

        let mut messages = Vec::new();
        if let Some(system) = &params.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": params.prompt}));

        let mut body = json!({"model": model, "messages": messages});
        if let Some(temperature) = params.temperature {
            body["temperature"] = json!(temperature);
        }
        if params.json {
            body["response_format"] = json!({"type": "json_object"});
        }

        let headers: Headers = vec![bearer(key)];
        let response = self
            .transport
            .post_json(&format!("{}/chat/completions", base), &headers, &body)
            .await?;
        Ok((extract_openai_text(&response)?, model.to_string()))
    }

    async fn gemini(&self, params: &TextParams) -> ProviderResult<(String, String)> {
        let (base, key) = self.endpoint()?;
        let model = self.model(params)?;

        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": params.prompt}]}],
        });
        if let Some(system) = &params.system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        let mut generation = serde_json::Map::new();
        if let Some(temperature) = params.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        if params.json {
            generation.insert("responseMimeType".into(), json!("application/json"));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        let headers: Headers = vec![("x-goog-api-key".to_string(), key.to_string())];
        let response = self
            .transport
            .post_json(&format!("{}/models/{}:generateContent", base, model), &headers, &body)
            .await?;
        Ok((extract_gemini_text(&response)?, model.to_string()))
    }
}

fn extract_openai_text(response: &Value) -> ProviderResult<String> {
    let choice = response
        .pointer("/choices/0")
        .ok_or_else(|| ProviderError::MalformedResponse("response has no choices".into()))?;

    if choice["finish_reason"] == "content_filter" {
        return Err(ProviderError::ContentPolicy(
            "completion stopped by content filter".into(),
        ));
    }
    if let Some(refusal) = choice.pointer("/message/refusal").and_then(Value::as_str) {
        return Err(ProviderError::Client {
            status: 200,
            body: format!("model refused: {}", refusal),
        });
    }

    choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::MalformedResponse("choice has no message content".into()))
}

fn extract_gemini_text(response: &Value) -> ProviderResult<String> {
    if let Some(reason) = response.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
        return Err(ProviderError::ContentPolicy(format!("prompt blocked: {}", reason)));
    }

    let candidate = response
        .pointer("/candidates/0")
        .ok_or_else(|| ProviderError::MalformedResponse("response has no candidates".into()))?;
    if let Some(reason) = candidate["finishReason"].as_str()
        && matches!(reason, "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII")
    {
        return Err(ProviderError::ContentPolicy(format!(
            "candidate blocked by safety filter: {}",
            reason
        )));
    }

    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::MalformedResponse("candidate has no content parts".into()))?;
    let text: String = parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect();
    if text.is_empty() {
        return Err(ProviderError::EmptyResult);
    }
    Ok(text)
}

/// Parse a JSON-mode completion, tolerating a surrounding markdown fence.
pub fn parse_json_completion(text: &str) -> ProviderResult<Value> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(inner)
        .map_err(|e| ProviderError::MalformedResponse(format!("completion is not valid JSON: {}", e)))
}

#[async_trait]
impl ProviderHandler for TextGenerationHandler {
    fn name(&self) -> &'static str {
        match self.provider {
            ProviderKind::Gemini => "gemini-text",
            _ => "openai-text",
        }
    }

    fn supports(&self, entry_type: EntryType) -> bool {
        entry_type == EntryType::Completion
    }

    async fn handle(&self, ctx: &JobContext) -> ProviderResult<Value> {
        let JobParams::Completion(params) = &ctx.params else {
            return Err(ProviderError::InvalidParams(format!(
                "{} cannot handle {}",
                self.name(),
                ctx.params.entry_type()
            )));
        };

        let (text, model) = match self.provider {
            ProviderKind::Gemini => self.gemini(params).await?,
            _ => self.openai(params).await?,
        };
        debug!(entry_id = %ctx.entry.id, model, chars = text.len(), "Completion received");

        let mut result = json!({"text": text, "model": model, "provider": self.provider.as_str()});
        if params.json {
            result["json"] = parse_json_completion(&text)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Attempt, ErrorClass, RetrySchedule};
    use crate::database::models::QueueEntry;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct Canned {
        response: Value,
        requests: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ProviderTransport for Canned {
        async fn post_json(&self, url: &str, _headers: &Headers, body: &Value) -> ProviderResult<Value> {
            self.requests.lock().push((url.to_string(), body.clone()));
            Ok(self.response.clone())
        }

        async fn get_json(&self, _url: &str, _headers: &Headers) -> ProviderResult<Value> {
            Ok(self.response.clone())
        }

        async fn get_bytes(&self, _url: &str) -> ProviderResult<Bytes> {
            Ok(Bytes::new())
        }
    }

    fn handler(provider: ProviderKind, response: Value) -> (TextGenerationHandler, Arc<Canned>) {
        let transport = Arc::new(Canned {
            response,
            requests: Mutex::new(Vec::new()),
        });
        let mut config = ProviderConfig::defaults_for(provider);
        config.api_key = Some("key".into());
        (TextGenerationHandler::new(provider, config, transport.clone()), transport)
    }

    fn ctx(provider: ProviderKind, params: Value) -> JobContext {
        let params_typed = JobParams::parse(provider, EntryType::Completion, &params).unwrap();
        JobContext::new(
            QueueEntry::new_pending("e1", provider, EntryType::Completion, params),
            params_typed,
            Attempt::first(&RetrySchedule::default()),
        )
    }

    #[tokio::test]
    async fn test_openai_json_mode() {
        let (handler, transport) = handler(
            ProviderKind::OpenAi,
            json!({"choices": [{"finish_reason": "stop", "message": {"content": "```json\n{\"scenes\": 3}\n```"}}]}),
        );
        let result = handler
            .handle(&ctx(ProviderKind::OpenAi, json!({"prompt": "Split", "json": true})))
            .await
            .unwrap();
        assert_eq!(result["json"]["scenes"], 3);

        let requests = transport.requests.lock();
        assert!(requests[0].0.ends_with("/chat/completions"));
        assert_eq!(requests[0].1["response_format"]["type"], "json_object");
    }

    #[tokio::test]
    async fn test_openai_invalid_json_is_malformed() {
        let (handler, _) = handler(
            ProviderKind::OpenAi,
            json!({"choices": [{"message": {"content": "not json"}}]}),
        );
        let err = handler
            .handle(&ctx(ProviderKind::OpenAi, json!({"prompt": "Split", "json": true})))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Malformed);
    }

    #[tokio::test]
    async fn test_gemini_safety_block() {
        let (handler, transport) = handler(
            ProviderKind::Gemini,
            json!({"candidates": [{"finishReason": "SAFETY"}]}),
        );
        let err = handler
            .handle(&ctx(ProviderKind::Gemini, json!({"prompt": "Describe"})))
            .await
            .unwrap_err();
        assert!(err.is_content_policy());
        assert!(transport.requests.lock()[0].0.contains(":generateContent"));
    }

    #[tokio::test]
    async fn test_gemini_text() {
        let (handler, _) = handler(
            ProviderKind::Gemini,
            json!({"candidates": [{"finishReason": "STOP", "content": {"parts": [{"text": "A "}, {"text": "harbor"}]}}]}),
        );
        let result = handler
            .handle(&ctx(ProviderKind::Gemini, json!({"prompt": "Describe"})))
            .await
            .unwrap();
        assert_eq!(result["text"], "A harbor");
        assert_eq!(result["provider"], "gemini");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let transport = Arc::new(Canned {
            response: json!({}),
            requests: Mutex::new(Vec::new()),
        });
        let handler = TextGenerationHandler::new(
            ProviderKind::OpenAi,
            ProviderConfig::defaults_for(ProviderKind::OpenAi),
            transport,
        );
        let err = handler
            .handle(&ctx(ProviderKind::OpenAi, json!({"prompt": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }
}
