//! API server setup and configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::checkup::Checkup;
use crate::config::{ConfigSource, parse_or};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::logging::LoggingHandle;
use crate::progress::ProgressTracker;
use crate::queue::QueueService;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Request body size limit in bytes
    pub body_limit: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 12600,
            enable_cors: true,
            body_limit: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl ApiServerConfig {
    /// Reads `API_BIND_ADDRESS` and `API_PORT`, falling back to defaults.
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let mut config = Self::default();

        if let Some(bind_address) = source.get("API_BIND_ADDRESS")
            && !bind_address.trim().is_empty()
        {
            config.bind_address = bind_address.trim().to_string();
        }
        config.port = parse_or(source, "API_PORT", config.port);

        config
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub queue: QueueService,
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: ProgressTracker,
    pub checkup: Checkup,
    /// Bearer token for administrative routes. They are refused when unset.
    pub admin_token: Option<Arc<str>>,
    pub logging: Option<Arc<LoggingHandle>>,
}

impl AppState {
    pub fn new(
        queue: QueueService,
        dispatcher: Arc<Dispatcher>,
        tracker: ProgressTracker,
        checkup: Checkup,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            queue,
            dispatcher,
            tracker,
            checkup,
            admin_token: None,
            logging: None,
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.map(Arc::from);
        self
    }

    pub fn with_logging(mut self, logging: Arc<LoggingHandle>) -> Self {
        self.logging = Some(logging);
        self
    }
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    /// `(mount path, directory)` pairs served as static files.
    static_dirs: Vec<(String, PathBuf)>,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            state,
            static_dirs: Vec::new(),
            cancel_token,
        }
    }

    /// Serve `dir` under `mount`, e.g. the local media stores.
    pub fn with_static_dir(mut self, mount: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.static_dirs.push((mount.into(), dir.into()));
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone());

        for (mount, dir) in &self.static_dirs {
            router = router.nest_service(mount, ServeDir::new(dir));
        }

        router = router.layer(DefaultBodyLimit::max(self.config.body_limit));

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    if req.uri().path().starts_with("/api/health") {
                        Span::none()
                    } else {
                        let mut make_span =
                            tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO);
                        use tower_http::trace::MakeSpan;
                        make_span.make_span(req)
                    }
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                        if span.is_disabled() {
                            return;
                        }
                        let on_response =
                            tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO);
                        use tower_http::trace::OnResponse;
                        on_response.on_response(res, latency, span);
                    },
                ),
        )
    }

    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid address: {}", e)))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
