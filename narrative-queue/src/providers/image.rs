//! Scene image generation for Stability, DALL-E, Wavespeed and Modal.
//!
//! DALL-E and Stability answer synchronously. Wavespeed and Modal accept a
//! task and are polled until it finishes. Either way the image ends up as
//! bytes that are uploaded to durable storage and the CDN mirror.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::http::{Headers, ProviderTransport, bearer};
use super::storage::MediaUploader;
use crate::config::ProviderConfig;
use crate::database::models::{EntryType, ProviderKind};
use crate::dispatch::{JobContext, PollConfig, PollStatus, ProviderError, ProviderHandler, poll_until};
use crate::queue::SceneImageParams;
use crate::queue::params::is_supported;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

const DEFAULT_SIZE: (u32, u32) = (1024, 1024);

/// Image payload as returned by a provider.
#[derive(Debug, Clone, PartialEq)]
enum ImageOutput {
    Base64(String),
    Url(String),
}

pub struct ImageGenerationHandler {
    provider: ProviderKind,
    config: ProviderConfig,
    transport: Arc<dyn ProviderTransport>,
    uploader: MediaUploader,
    poll: PollConfig,
}

impl ImageGenerationHandler {
    pub fn new(
        provider: ProviderKind,
        config: ProviderConfig,
        transport: Arc<dyn ProviderTransport>,
        uploader: MediaUploader,
        poll: PollConfig,
    ) -> Self {
        Self {
            provider,
            config,
            transport,
            uploader,
            poll,
        }
    }

    fn base_url(&self) -> ProviderResult<&str> {
        self.config
            .base_url
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured(format!("{} base URL", self.provider)))
    }

    fn auth(&self) -> ProviderResult<Headers> {
        match (&self.config.api_key, self.provider) {
            (Some(key), _) => Ok(vec![bearer(key)]),
            // Self-hosted Modal endpoints may run without auth.
            (None, ProviderKind::Modal) => Ok(Vec::new()),
            (None, provider) => Err(ProviderError::NotConfigured(format!("{} API key", provider))),
        }
    }

    async fn dalle(&self, params: &SceneImageParams) -> ProviderResult<ImageOutput> {
        let base = self.base_url()?;
        let (width, height) = size_of(params);
        let body = json!({
            "model": self.config.model.as_deref().unwrap_or("dall-e-3"),
            "prompt": params.prompt,
            "n": 1,
            "size": format!("{}x{}", width, height),
            "response_format": "b64_json",
        });
        let response = self
            .transport
            .post_json(&format!("{}/images/generations", base), &self.auth()?, &body)
            .await?;
        dalle_output(&response)
    }

    async fn stability(&self, entry_type: EntryType, params: &SceneImageParams) -> ProviderResult<ImageOutput> {
        let base = self.base_url()?;
        let mut headers = self.auth()?;
        headers.push(("Accept".to_string(), "application/json".to_string()));

        let (path, mut body) = match entry_type {
            EntryType::Generate => ("stable-image/generate/core", json!({"aspect_ratio": "1:1"})),
            EntryType::Structure => (
                "stable-image/control/structure",
                json!({"image": params.image_url, "control_strength": 0.7}),
            ),
            EntryType::OutpaintTall => (
                "stable-image/edit/outpaint",
                json!({"image": params.image_url, "up": 512, "down": 512}),
            ),
            EntryType::OutpaintWide => (
                "stable-image/edit/outpaint",
                json!({"image": params.image_url, "left": 512, "right": 512}),
            ),
            other => return Err(unsupported(self.provider, other)),
        };
        body["prompt"] = json!(params.prompt);
        body["output_format"] = json!("png");
        if let Some(negative) = &params.negative_prompt {
            body["negative_prompt"] = json!(negative);
        }

        let response = self
            .transport
            .post_json(&format!("{}/{}", base, path), &headers, &body)
            .await?;
        stability_output(&response)
    }

    async fn wavespeed(&self, entry_type: EntryType, params: &SceneImageParams) -> ProviderResult<ImageOutput> {
        let base = self.base_url()?;
        let headers = self.auth()?;
        let model = self
            .config
            .model
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured("wavespeed model".into()))?;
        let (width, height) = size_of(params);

        let mut body = json!({
            "prompt": params.prompt,
            "size": format!("{}*{}", width, height),
            "enable_safety_checker": true,
        });
        if entry_type == EntryType::Style {
            body["image"] = json!(params.image_url);
            body["style"] = json!(params.style);
        }

        let submitted = self
            .transport
            .post_json(&format!("{}/{}", base, model), &headers, &body)
            .await?;
        let task_id = submitted
            .pointer("/data/id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::MalformedResponse("wavespeed response has no task id".into()))?
            .to_string();
        debug!(task_id = %task_id, "Wavespeed task submitted");

        let status_url = format!("{}/predictions/{}/result", base, task_id);
        poll_until(&self.poll, |_| {
            let status_url = status_url.clone();
            let headers = headers.clone();
            async move {
                let status = self.transport.get_json(&status_url, &headers).await?;
                Ok(wavespeed_status(&status))
            }
        })
        .await
    }

    async fn modal(&self, entry_type: EntryType, params: &SceneImageParams) -> ProviderResult<ImageOutput> {
        let base = self.base_url()?;
        let headers = self.auth()?;
        let (width, height) = match entry_type {
            EntryType::OutpaintTall => (768, 1344),
            EntryType::OutpaintWide => (1344, 768),
            _ => size_of(params),
        };
        let body = json!({
            "task": entry_type.as_str(),
            "prompt": params.prompt,
            "negativePrompt": params.negative_prompt,
            "imageUrl": params.image_url,
            "style": params.style,
            "width": width,
            "height": height,
        });

        let submitted = self
            .transport
            .post_json(&format!("{}/submit", base), &headers, &body)
            .await?;
        let call_id = submitted["call_id"]
            .as_str()
            .ok_or_else(|| ProviderError::MalformedResponse("modal response has no call_id".into()))?
            .to_string();
        debug!(call_id = %call_id, "Modal task submitted");

        let status_url = format!("{}/result/{}", base, call_id);
        poll_until(&self.poll, |_| {
            let status_url = status_url.clone();
            let headers = headers.clone();
            async move {
                let status = self.transport.get_json(&status_url, &headers).await?;
                Ok(modal_status(&status))
            }
        })
        .await
    }

    async fn fetch(&self, output: ImageOutput) -> ProviderResult<Bytes> {
        let bytes = match output {
            ImageOutput::Base64(data) => Bytes::from(
                BASE64
                    .decode(data.trim())
                    .map_err(|e| ProviderError::MalformedResponse(format!("invalid base64 image: {}", e)))?,
            ),
            ImageOutput::Url(url) => self.transport.get_bytes(&url).await?,
        };
        if bytes.is_empty() {
            return Err(ProviderError::EmptyResult);
        }
        Ok(bytes)
    }
}

fn unsupported(provider: ProviderKind, entry_type: EntryType) -> ProviderError {
    ProviderError::InvalidParams(format!("{} does not support {}", provider, entry_type))
}

fn size_of(params: &SceneImageParams) -> (u32, u32) {
    match (params.width, params.height) {
        (Some(w), Some(h)) => (w, h),
        _ => DEFAULT_SIZE,
    }
}

fn dalle_output(response: &Value) -> ProviderResult<ImageOutput> {
    let item = response
        .pointer("/data/0")
        .ok_or_else(|| ProviderError::MalformedResponse("response has no data".into()))?;
    if let Some(b64) = item["b64_json"].as_str() {
        return Ok(ImageOutput::Base64(b64.to_string()));
    }
    if let Some(url) = item["url"].as_str() {
        return Ok(ImageOutput::Url(url.to_string()));
    }
    Err(ProviderError::EmptyResult)
}

fn stability_output(response: &Value) -> ProviderResult<ImageOutput> {
    let (image, finish) = match response.pointer("/artifacts/0") {
        Some(artifact) => (&artifact["base64"], &artifact["finishReason"]),
        None => (&response["image"], &response["finish_reason"]),
    };
    if finish.as_str() == Some("CONTENT_FILTERED") {
        return Err(ProviderError::ContentPolicy("image rejected by content filter".into()));
    }
    image
        .as_str()
        .map(|b64| ImageOutput::Base64(b64.to_string()))
        .ok_or(ProviderError::EmptyResult)
}

fn wavespeed_status(status: &Value) -> PollStatus<ImageOutput> {
    let data = &status["data"];
    match data["status"].as_str() {
        Some("completed") => PollStatus::Completed(
            data.pointer("/outputs/0")
                .and_then(Value::as_str)
                .map(|url| ImageOutput::Url(url.to_string())),
        ),
        Some("failed") => PollStatus::Failed(
            data["error"].as_str().unwrap_or("wavespeed task failed").to_string(),
        ),
        _ => PollStatus::Pending,
    }
}

fn modal_status(status: &Value) -> PollStatus<ImageOutput> {
    match status["status"].as_str() {
        Some("completed") | Some("success") => {
            let output = status["image_base64"]
                .as_str()
                .map(|b64| ImageOutput::Base64(b64.to_string()))
                .or_else(|| status["image_url"].as_str().map(|url| ImageOutput::Url(url.to_string())));
            PollStatus::Completed(output)
        }
        Some("failed") | Some("error") => PollStatus::Failed(
            status["error"].as_str().unwrap_or("modal task failed").to_string(),
        ),
        _ => PollStatus::Pending,
    }
}

#[async_trait]
impl ProviderHandler for ImageGenerationHandler {
    fn name(&self) -> &'static str {
        match self.provider {
            ProviderKind::Stability => "stability-image",
            ProviderKind::Dalle => "dalle-image",
            ProviderKind::Wavespeed => "wavespeed-image",
            _ => "modal-image",
        }
    }

    fn supports(&self, entry_type: EntryType) -> bool {
        is_supported(self.provider, entry_type)
    }

    async fn handle(&self, ctx: &JobContext) -> ProviderResult<Value> {
        let entry_type = ctx.params.entry_type();
        let Some(params) = ctx.params.scene_image() else {
            return Err(unsupported(self.provider, entry_type));
        };
        if !self.supports(entry_type) {
            return Err(unsupported(self.provider, entry_type));
        }

        let output = match self.provider {
            ProviderKind::Dalle => self.dalle(params).await?,
            ProviderKind::Stability => self.stability(entry_type, params).await?,
            ProviderKind::Wavespeed => self.wavespeed(entry_type, params).await?,
            ProviderKind::Modal => self.modal(entry_type, params).await?,
            other => return Err(unsupported(other, entry_type)),
        };
        let bytes = self.fetch(output).await?;

        let key = format!("images/{}/{}.png", self.provider, ctx.entry_id());
        let media = self.uploader.upload(&key, bytes, "image/png").await?;
        info!(
            entry_id = %ctx.entry_id(),
            provider = %self.provider,
            scene_id = %params.scene_id,
            "Image uploaded"
        );

        Ok(json!({
            "durableUrl": media.durable_url,
            "cdnUrl": media.cdn_url,
            "provider": self.provider.as_str(),
            "entryType": entry_type.as_str(),
            "sceneId": params.scene_id,
            "chapter": params.chapter,
            "sceneNumber": params.scene_number,
        }))
    }
}
