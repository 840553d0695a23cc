//! API server setup and configuration.

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use std::sync::Arc;
use tracing::Span;

use crate::api::routes;
use crate::control::ControlService;
use crate::error::Result;
use crate::logging::LoggingConfig;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address the server binds to
    pub address: SocketAddr,
    /// Enable CORS
    pub enable_cors: bool,
    /// Request body size limit in bytes
    pub body_limit: usize,
}

impl ApiServerConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            enable_cors: true,
            body_limit: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub control: ControlService,
    /// Logging configuration for dynamic log level changes
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    pub fn new(control: ControlService) -> Self {
        Self {
            start_time: Instant::now(),
            control,
            logging_config: None,
        }
    }

    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone())
            .layer(DefaultBodyLimit::max(self.config.body_limit));

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        // Health probes poll frequently and are not traced.
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    if req.uri().path().starts_with("/health") {
                        Span::none()
                    } else {
                        let mut make_span =
                            tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO);
                        use tower_http::trace::MakeSpan;
                        make_span.make_span(req)
                    }
                })
                .on_request(|req: &Request, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    let mut on_request =
                        tower_http::trace::DefaultOnRequest::new().level(tracing::Level::DEBUG);
                    use tower_http::trace::OnRequest;
                    on_request.on_request(req, span);
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

    /// Serve until the cancel token fires.
    pub async fn run(&self) -> Result<()> {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.address).await?;

        tracing::info!("Control API listening on http://{}", self.config.address);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("Control API shutting down...");
            })
            .await?;

        Ok(())
    }

    /// Stop accepting requests.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
