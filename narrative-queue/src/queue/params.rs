//! Typed job parameters.
//!
//! `params` is stored as JSON, but every entry is validated against the
//! variant its `(type, entryType)` pair selects, both when it is created and
//! again when a worker claims it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::models::{EntryType, ProviderKind};
use crate::{Error, Result};

/// Scene image work: generation, structure control, outpainting, styling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneImageParams {
    #[serde(default)]
    pub scene_id: String,
    #[serde(default)]
    pub chapter: Option<u32>,
    #[serde(default, alias = "scene_number")]
    pub scene_number: Option<u32>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Source image for structure, outpaint and style operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

/// LLM completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<u32>,
    /// Caller-chosen label that makes the entry deduplicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Ask for a JSON response and parse it.
    #[serde(default)]
    pub json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeParams {
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub chapter: Option<u32>,
    #[serde(default)]
    pub audio_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportParams {
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub source_url: String,
}

/// Parameters keyed by entry type.
#[derive(Debug, Clone, PartialEq)]
pub enum JobParams {
    Structure(SceneImageParams),
    OutpaintTall(SceneImageParams),
    OutpaintWide(SceneImageParams),
    Style(SceneImageParams),
    Generate(SceneImageParams),
    Completion(TextParams),
    Transcribe(TranscribeParams),
    Import(ImportParams),
}

/// Whether `provider` implements `entry_type`.
pub fn is_supported(provider: ProviderKind, entry_type: EntryType) -> bool {
    use EntryType::*;
    use ProviderKind::*;
    matches!(
        (provider, entry_type),
        (Stability, Structure | OutpaintTall | OutpaintWide | Generate)
            | (Dalle, Generate)
            | (Modal, Generate | OutpaintTall | OutpaintWide | Style)
            | (Wavespeed, Generate | Style)
            | (Gemini | OpenAi, Completion)
            | (Transcription, Transcribe)
            | (BookImport, Import)
    )
}

fn decode<T: serde::de::DeserializeOwned>(entry_type: EntryType, value: &Value) -> Result<T> {
    if !value.is_object() {
        return Err(Error::validation(format!(
            "params for {} must be a JSON object",
            entry_type
        )));
    }
    serde_json::from_value(value.clone())
        .map_err(|e| Error::validation(format!("invalid params for {}: {}", entry_type, e)))
}

impl JobParams {
    /// Validate `value` against the variant selected by `(provider, entry_type)`.
    pub fn parse(provider: ProviderKind, entry_type: EntryType, value: &Value) -> Result<Self> {
        if !is_supported(provider, entry_type) {
            return Err(Error::validation(format!(
                "{} does not support entry type {}",
                provider, entry_type
            )));
        }

        let params = match entry_type {
            EntryType::Structure => Self::Structure(decode(entry_type, value)?),
            EntryType::OutpaintTall => Self::OutpaintTall(decode(entry_type, value)?),
            EntryType::OutpaintWide => Self::OutpaintWide(decode(entry_type, value)?),
            EntryType::Style => Self::Style(decode(entry_type, value)?),
            EntryType::Generate => Self::Generate(decode(entry_type, value)?),
            EntryType::Completion => Self::Completion(decode(entry_type, value)?),
            EntryType::Transcribe => Self::Transcribe(decode(entry_type, value)?),
            EntryType::Import => Self::Import(decode(entry_type, value)?),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::Structure(_) => EntryType::Structure,
            Self::OutpaintTall(_) => EntryType::OutpaintTall,
            Self::OutpaintWide(_) => EntryType::OutpaintWide,
            Self::Style(_) => EntryType::Style,
            Self::Generate(_) => EntryType::Generate,
            Self::Completion(_) => EntryType::Completion,
            Self::Transcribe(_) => EntryType::Transcribe,
            Self::Import(_) => EntryType::Import,
        }
    }

    pub fn scene_image(&self) -> Option<&SceneImageParams> {
        match self {
            Self::Structure(p)
            | Self::OutpaintTall(p)
            | Self::OutpaintWide(p)
            | Self::Style(p)
            | Self::Generate(p) => Some(p),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            Self::Structure(p)
            | Self::OutpaintTall(p)
            | Self::OutpaintWide(p)
            | Self::Style(p)
            | Self::Generate(p) => serde_json::to_value(p)?,
            Self::Completion(p) => serde_json::to_value(p)?,
            Self::Transcribe(p) => serde_json::to_value(p)?,
            Self::Import(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Payload checks beyond shape. Identity fields are checked by the key builder.
    fn validate(&self) -> Result<()> {
        match self {
            Self::Generate(p) => {
                if p.prompt.trim().is_empty() {
                    return Err(Error::validation("generate requires a prompt"));
                }
            }
            Self::Structure(p) | Self::OutpaintTall(p) | Self::OutpaintWide(p) => {
                if p.image_url.as_deref().is_none_or(str::is_empty) {
                    return Err(Error::validation(format!(
                        "{} requires imageUrl",
                        self.entry_type()
                    )));
                }
            }
            Self::Style(p) => {
                if p.image_url.as_deref().is_none_or(str::is_empty) {
                    return Err(Error::validation("style requires imageUrl"));
                }
                if p.style.as_deref().is_none_or(str::is_empty) {
                    return Err(Error::validation("style requires a style name"));
                }
            }
            Self::Completion(p) => {
                if p.prompt.trim().is_empty() {
                    return Err(Error::validation("completion requires a prompt"));
                }
            }
            Self::Transcribe(p) => {
                if p.audio_path.is_empty() {
                    return Err(Error::validation("transcribe requires audioPath"));
                }
            }
            Self::Import(p) => {
                if p.source_url.is_empty() {
                    return Err(Error::validation("import requires sourceUrl"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_accepts_snake_case_scene_number() {
        let params = JobParams::parse(
            ProviderKind::Stability,
            EntryType::Structure,
            &json!({"sceneId": "S1", "chapter": 0, "scene_number": 2, "imageUrl": "https://img/1.png"}),
        )
        .unwrap();
        let scene = params.scene_image().unwrap();
        assert_eq!(scene.scene_number, Some(2));
        assert_eq!(scene.chapter, Some(0));
    }

    #[test]
    fn test_unsupported_pair_is_rejected() {
        let err = JobParams::parse(
            ProviderKind::Dalle,
            EntryType::Style,
            &json!({"sceneId": "S1", "imageUrl": "u", "style": "ink"}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(is_supported(ProviderKind::Modal, EntryType::Style));
        assert!(!is_supported(ProviderKind::OpenAi, EntryType::Generate));
    }

    #[test]
    fn test_payload_checks() {
        assert!(
            JobParams::parse(ProviderKind::OpenAi, EntryType::Completion, &json!({"prompt": " "}))
                .is_err()
        );
        assert!(
            JobParams::parse(ProviderKind::Modal, EntryType::OutpaintWide, &json!({"sceneId": "S1"}))
                .is_err()
        );
        assert!(JobParams::parse(ProviderKind::Gemini, EntryType::Completion, &json!("text")).is_err());
        assert!(
            JobParams::parse(
                ProviderKind::BookImport,
                EntryType::Import,
                &json!({"sku": "b1", "sourceUrl": "https://books/b1.epub"})
            )
            .is_ok()
        );
    }

    #[test]
    fn test_to_value_uses_wire_names() {
        let params = JobParams::parse(
            ProviderKind::Transcription,
            EntryType::Transcribe,
            &json!({"sku": "b1", "chapter": 3, "audioPath": "audio/b1/3.mp3"}),
        )
        .unwrap();
        let value = params.to_value().unwrap();
        assert_eq!(value["audioPath"], "audio/b1/3.mp3");
        assert_eq!(params.entry_type(), EntryType::Transcribe);
    }
}
