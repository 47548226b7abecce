use async_trait::async_trait;
use serde_json::{Value, json};

use crate::database::models::{EntryType, ProviderKind};
use crate::dispatch::{JobContext, ProviderError, ProviderHandler};
use crate::queue::JobParams;
use crate::queue::params::is_supported;

/// Returns canned results without any network call. Used in mock dispatch mode.
pub struct MockHandler {
    provider: ProviderKind,
}

impl MockHandler {
    pub fn new(provider: ProviderKind) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ProviderHandler for MockHandler {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports(&self, entry_type: EntryType) -> bool {
        is_supported(self.provider, entry_type)
    }

    async fn handle(&self, ctx: &JobContext) -> Result<Value, ProviderError> {
        let id = ctx.entry_id();
        let result = match &ctx.params {
            JobParams::Completion(p) => {
                let mut result = json!({
                    "text": format!("mock completion for {}", id),
                    "model": "mock",
                    "provider": self.provider.as_str(),
                });
                if p.json {
                    result["json"] = json!({"mock": true, "entryId": id});
                }
                result
            }
            JobParams::Transcribe(p) => json!({
                "provider": self.provider.as_str(),
                "entryType": "transcribe",
                "sku": p.sku,
                "output": {"mock": true, "chapter": p.chapter},
            }),
            JobParams::Import(p) => json!({
                "provider": self.provider.as_str(),
                "entryType": "import",
                "sku": p.sku,
                "output": {"mock": true},
            }),
            image => {
                let entry_type = image.entry_type();
                let scene = image.scene_image().cloned().unwrap_or_default();
                let key = format!("images/{}/{}.png", self.provider, id);
                json!({
                    "durableUrl": format!("mock://durable/{}", key),
                    "cdnUrl": format!("mock://cdn/{}", key),
                    "provider": self.provider.as_str(),
                    "entryType": entry_type.as_str(),
                    "sceneId": scene.scene_id,
                    "chapter": scene.chapter,
                    "sceneNumber": scene.scene_number,
                })
            }
        };
        Ok(result)
    }
}
