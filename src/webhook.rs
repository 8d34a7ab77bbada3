//! WeChat webhook HTTP handlers

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{Bot, WechatAdapter};
use crate::config::ServerConfig;
use crate::error::AdapterError;
use crate::types::{SecretInfo, WebhookParams};

/// Webhook server state
#[derive(Clone)]
pub struct WebhookState {
    pub config: ServerConfig,
    pub adapter: Arc<WechatAdapter>,
    pub bot: Arc<dyn Bot>,
    /// Parent of every per-request cancellation token
    pub shutdown: CancellationToken,
}

/// Build the webhook router
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/wechat/webhook", get(verify).post(handle_message))
        .route("/health", get(health_check))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Run the webhook HTTP server until `shutdown` fires
pub async fn run_server(addr: SocketAddr, state: WebhookState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Middleware to log all incoming HTTP requests
async fn log_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("HTTP {} {}", method, path);

    let response = next.run(req).await;

    info!("Response status: {}", response.status());

    response
}

/// Webhook verification (GET request from WeChat)
async fn verify(
    State(state): State<WebhookState>,
    Query(params): Query<WebhookParams>,
) -> Result<String, StatusCode> {
    info!(
        "Received verification request: timestamp={}, nonce={}",
        params.timestamp, params.nonce
    );

    if params.echostr.as_deref().is_none_or(str::is_empty) {
        warn!("Verification request without echostr");
        return Err(StatusCode::BAD_REQUEST);
    }

    run_turn(&state, params, String::new()).await
}

/// Handle incoming message (POST request from WeChat)
async fn handle_message(
    State(state): State<WebhookState>,
    Query(params): Query<WebhookParams>,
    body: Bytes,
) -> Result<String, StatusCode> {
    info!(
        "Received message: timestamp={}, nonce={}, encrypt_type={:?}",
        params.timestamp, params.nonce, params.encrypt_type
    );
    debug!("Request body length: {} bytes", body.len());

    let body = String::from_utf8_lossy(&body).into_owned();
    if state.config.debug_mode {
        debug!("Raw request body: {}", body);
    }

    run_turn(&state, params, body).await
}

async fn run_turn(
    state: &WebhookState,
    params: WebhookParams,
    body: String,
) -> Result<String, StatusCode> {
    let settings = &state.config.settings;
    let secret = SecretInfo::from_params(params, settings);

    state
        .adapter
        .process(
            &body,
            &secret,
            settings,
            state.bot.as_ref(),
            state.shutdown.child_token(),
        )
        .await
        .map_err(|e| {
            let status = status_for(&e);
            error!("Webhook turn failed ({}): {}", status, e);
            status
        })
}

fn status_for(err: &AdapterError) -> StatusCode {
    match err {
        AdapterError::Authentication(_) => StatusCode::FORBIDDEN,
        AdapterError::Decryption(_) | AdapterError::Parse(_) => StatusCode::BAD_REQUEST,
        AdapterError::Configuration(_)
        | AdapterError::Reply(_)
        | AdapterError::Delivery { .. }
        | AdapterError::Turn(_)
        | AdapterError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
