//! Deterministic entry ids.
//!
//! An entry's id is derived from its semantic identity (provider, operation,
//! target, retry flag), so enqueueing the same work twice lands on the same
//! row and create-if-absent drops the duplicate.

use chrono::Utc;
use uuid::Uuid;

use super::params::{ImportParams, JobParams, SceneImageParams, TextParams, TranscribeParams};
use crate::database::models::{EntryType, ProviderKind};
use crate::{Error, Result};

/// Marks the single permitted retry twin of an entry.
pub const RETRY_SUFFIX: &str = "_retry";

/// Escapes the separator inside an identity value so that distinct
/// identities never join to the same id and no value can forge `_retry`.
fn clean(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            '_' => out.push_str("%5F"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}

fn require<'a>(value: &'a str, field: &'static str) -> Result<&'a str> {
    if value.trim().is_empty() {
        Err(Error::identity(field))
    } else {
        Ok(value)
    }
}

fn require_num(value: Option<u32>, field: &'static str) -> Result<u32> {
    value.ok_or(Error::identity(field))
}

fn join(parts: &[&str], retry: bool) -> String {
    let mut key = parts.iter().map(|p| clean(p)).collect::<Vec<_>>().join("_");
    if retry {
        key.push_str(RETRY_SUFFIX);
    }
    key
}

/// `{type}_{entryType}_{sceneId}_{chapter}_{sceneNumber}`, plus `_{style}` for styling.
pub fn scene_image_key(
    provider: ProviderKind,
    entry_type: EntryType,
    params: &SceneImageParams,
    retry: bool,
) -> Result<String> {
    let scene_id = require(&params.scene_id, "sceneId")?;
    let chapter = require_num(params.chapter, "chapter")?.to_string();
    let scene_number = require_num(params.scene_number, "sceneNumber")?.to_string();

    let mut parts = vec![
        provider.as_str(),
        entry_type.as_str(),
        scene_id,
        chapter.as_str(),
        scene_number.as_str(),
    ];
    if entry_type == EntryType::Style {
        parts.push(require(params.style.as_deref().unwrap_or_default(), "style")?);
    }
    Ok(join(&parts, retry))
}

/// `{type}_{entryType}_{sku}[_{chapter}]_{tag}`. Untagged completions are
/// free-form and get a generic key.
pub fn text_key(
    provider: ProviderKind,
    entry_type: EntryType,
    params: &TextParams,
    retry: bool,
) -> Result<String> {
    let Some(tag) = params.tag.as_deref() else {
        return Ok(generic_key(provider, entry_type));
    };
    let tag = require(tag, "tag")?;
    let sku = require(params.sku.as_deref().unwrap_or_default(), "sku")?;
    let chapter = params.chapter.map(|c| c.to_string());

    let mut parts = vec![provider.as_str(), entry_type.as_str(), sku];
    if let Some(chapter) = chapter.as_deref() {
        parts.push(chapter);
    }
    parts.push(tag);
    Ok(join(&parts, retry))
}

/// `{type}_{entryType}_{sku}_{chapter}`.
pub fn transcribe_key(
    provider: ProviderKind,
    entry_type: EntryType,
    params: &TranscribeParams,
    retry: bool,
) -> Result<String> {
    let sku = require(&params.sku, "sku")?;
    let chapter = require_num(params.chapter, "chapter")?.to_string();
    Ok(join(&[provider.as_str(), entry_type.as_str(), sku, chapter.as_str()], retry))
}

/// `{type}_{entryType}_{sku}`.
pub fn import_key(
    provider: ProviderKind,
    entry_type: EntryType,
    params: &ImportParams,
    retry: bool,
) -> Result<String> {
    let sku = require(&params.sku, "sku")?;
    Ok(join(&[provider.as_str(), entry_type.as_str(), sku], retry))
}

/// Unique key for free-form entries; never collides, so never deduplicates.
pub fn generic_key(provider: ProviderKind, entry_type: EntryType) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}",
        provider.as_str(),
        entry_type.as_str(),
        Utc::now().timestamp_millis(),
        &random[..8]
    )
}

/// Id for an entry with the given params.
pub fn entry_key(provider: ProviderKind, params: &JobParams, retry: bool) -> Result<String> {
    let entry_type = params.entry_type();
    match params {
        JobParams::Structure(p)
        | JobParams::OutpaintTall(p)
        | JobParams::OutpaintWide(p)
        | JobParams::Style(p)
        | JobParams::Generate(p) => scene_image_key(provider, entry_type, p, retry),
        JobParams::Completion(p) => text_key(provider, entry_type, p, retry),
        JobParams::Transcribe(p) => transcribe_key(provider, entry_type, p, retry),
        JobParams::Import(p) => import_key(provider, entry_type, p, retry),
    }
}

/// Id of the retry twin, or `None` if `id` already is one.
pub fn retry_key(id: &str) -> Option<String> {
    if id.ends_with(RETRY_SUFFIX) {
        None
    } else {
        Some(format!("{}{}", id, RETRY_SUFFIX))
    }
}
