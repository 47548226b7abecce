//! Provider handlers and the collaborators they share.

pub mod http;
pub mod image;
pub mod mock;
pub mod service_call;
pub mod storage;
pub mod text;

use std::sync::Arc;

pub use http::{Headers, HttpTransport, ProviderTransport, bearer};
pub use image::ImageGenerationHandler;
pub use mock::MockHandler;
pub use service_call::ServiceCallHandler;
pub use storage::{LocalObjectStore, MediaUploader, ObjectStore, UploadedMedia};
pub use text::TextGenerationHandler;

use crate::config::ProviderConfig;
use crate::database::models::ProviderKind;
use crate::dispatch::{DispatchMode, PollConfig, ProviderHandler};

/// Shared collaborators handed to every live handler.
#[derive(Clone)]
pub struct HandlerDeps {
    pub transport: Arc<dyn ProviderTransport>,
    pub uploader: MediaUploader,
    pub poll: PollConfig,
}

/// The handler serving `provider` in `mode`.
pub fn build_handler(
    provider: ProviderKind,
    mode: DispatchMode,
    config: &ProviderConfig,
    deps: &HandlerDeps,
) -> Arc<dyn ProviderHandler> {
    if mode == DispatchMode::Mock {
        return Arc::new(MockHandler::new(provider));
    }

    let config = config.clone();
    match provider {
        ProviderKind::OpenAi | ProviderKind::Gemini => Arc::new(TextGenerationHandler::new(
            provider,
            config,
            deps.transport.clone(),
        )),
        ProviderKind::Stability | ProviderKind::Dalle | ProviderKind::Wavespeed | ProviderKind::Modal => {
            Arc::new(ImageGenerationHandler::new(
                provider,
                config,
                deps.transport.clone(),
                deps.uploader.clone(),
                deps.poll,
            ))
        }
        ProviderKind::Transcription | ProviderKind::BookImport => Arc::new(ServiceCallHandler::new(
            provider,
            config,
            deps.transport.clone(),
            deps.poll,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::EntryType;

    fn deps(dir: &std::path::Path) -> HandlerDeps {
        HandlerDeps {
            transport: Arc::new(HttpTransport::new(reqwest::Client::new())),
            uploader: MediaUploader::new(
                Arc::new(LocalObjectStore::new("durable", dir.join("d"), "https://d.local")),
                Arc::new(LocalObjectStore::new("cdn", dir.join("c"), "https://c.local")),
            ),
            poll: PollConfig::default(),
        }
    }

    #[test]
    fn test_handler_selection() {
        crate::utils::http_client::install_rustls_provider();
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(dir.path());

        let build = |provider, mode| {
            build_handler(provider, mode, &ProviderConfig::defaults_for(provider), &deps)
        };
        assert_eq!(build(ProviderKind::Gemini, DispatchMode::Live).name(), "gemini-text");
        assert_eq!(build(ProviderKind::Wavespeed, DispatchMode::Live).name(), "wavespeed-image");
        assert_eq!(build(ProviderKind::BookImport, DispatchMode::Live).name(), "book-import-service");
        assert_eq!(build(ProviderKind::Modal, DispatchMode::Mock).name(), "mock");
        assert!(build(ProviderKind::Dalle, DispatchMode::Live).supports(EntryType::Generate));
        assert!(!build(ProviderKind::Dalle, DispatchMode::Live).supports(EntryType::Style));
    }
}
