// Router assembly and process lifecycle.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};

use crate::api;
use crate::auth::{jwt::TokenVerifier, Authenticator};
use crate::config::GatewayConfig;
use crate::error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope};
use crate::metrics::{self, GatewayMetrics};
use crate::outbox::{OutboxManager, OutboxStore};
use crate::registry::ConnectionRegistry;
use crate::run::{EventEmitter, RunRegistry, RunSequencer};
use crate::ws;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Shared handles for every route and socket task.
#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<TokenVerifier>,
    pub authenticator: Arc<Authenticator>,
    pub registry: Arc<ConnectionRegistry>,
    pub outbox: Arc<OutboxManager>,
    pub emitter: Arc<EventEmitter>,
    pub metrics: Arc<GatewayMetrics>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub malformed_frame_limit: u32,
    pub cors_origins: Option<String>,
}

/// Constructs every component from configuration. No process-wide
/// singletons: tests build as many isolated states as they need.
pub async fn build_state(config: &GatewayConfig) -> anyhow::Result<AppState> {
    let verifier =
        Arc::new(TokenVerifier::new(&config.jwt_secret).context("invalid gateway JWT secret")?);
    let authenticator = Arc::new(Authenticator::new(
        Arc::clone(&verifier),
        config.auth_timeout,
        config.test_bypass_enabled,
    ));
    let registry = Arc::new(ConnectionRegistry::new());
    let store = OutboxStore::from_config(config)
        .await
        .context("failed to initialize the outbox store")?;
    let outbox = Arc::new(OutboxManager::new(store, config.max_delivery_attempts));
    let emitter = Arc::new(EventEmitter::new(
        Arc::new(RunRegistry::new()),
        Arc::new(RunSequencer::new()),
        Arc::clone(&registry),
        Arc::clone(&outbox),
    ));
    let gateway_metrics = Arc::new(GatewayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&gateway_metrics));

    Ok(AppState {
        verifier,
        authenticator,
        registry,
        outbox,
        emitter,
        metrics: gateway_metrics,
        heartbeat_interval: config.heartbeat_interval,
        heartbeat_timeout: config.heartbeat_timeout,
        malformed_frame_limit: config.malformed_frame_limit,
        cors_origins: config.cors_origins.clone(),
    })
}

pub fn build_router(state: AppState) -> Router {
    let metrics_handle = Arc::clone(&state.metrics);
    let cors = cors_layer(state.cors_origins.as_deref());

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/metrics",
            get(move || {
                let metrics_handle = Arc::clone(&metrics_handle);
                async move { metrics_handle.render_prometheus() }
            }),
        )
        .merge(ws::router(state.clone()))
        .merge(api::router(state));

    if let Some(cors) = cors {
        router = router.layer(cors);
    }

    apply_middleware(router)
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

fn cors_layer(origins: Option<&str>) -> Option<CorsLayer> {
    let origins = origins?;
    if origins.trim() == "*" {
        return Some(CorsLayer::new().allow_origin(Any));
    }

    let parsed: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|origin| HeaderValue::from_str(origin.trim()).ok())
        .collect();
    Some(CorsLayer::new().allow_origin(AllowOrigin::list(parsed)))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;

    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}
