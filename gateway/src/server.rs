//! HTTP surface: WebSocket upgrade, health, tools listing, metrics
//!
//! Every route passes through the same stack: security headers, CORS for the
//! configured origins, then the per-client rate limiter.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{future, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, warn};

use netdiag_tools::Tool;

use crate::error::TransportError;
use crate::manager::SessionManager;
use crate::metrics::MetricsSnapshot;
use crate::rate_limit::RateLimiter;
use crate::session::Frame;

/// Combined state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    manager: Arc<SessionManager>,
    limiter: Option<Arc<RateLimiter>>,
    allowed_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        manager: Arc<SessionManager>,
        limiter: Option<RateLimiter>,
        allowed_origins: Vec<String>,
    ) -> Self {
        Self {
            manager,
            limiter: limiter.map(Arc::new),
            allowed_origins: Arc::new(allowed_origins),
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.allowed_origins);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .route("/api/v1/tools", get(list_tools))
        .route("/api/v1/metrics", get(get_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(cors)
        .layer(security_header(header::X_CONTENT_TYPE_OPTIONS, "nosniff"))
        .layer(security_header(header::X_FRAME_OPTIONS, "DENY"))
        .layer(security_header(header::X_XSS_PROTECTION, "1; mode=block"))
        .layer(security_header(
            header::REFERRER_POLICY,
            "strict-origin-when-cross-origin",
        ))
        .layer(security_header(
            header::CONTENT_SECURITY_POLICY,
            "default-src 'self'",
        ))
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("HTTP server failed")
}

fn security_header(
    name: header::HeaderName,
    value: &'static str,
) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::if_not_present(name, HeaderValue::from_static(value))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid allowed origin: {origin}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(86400))
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(limiter) = &state.limiter {
        let client = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        if !limiter.check(&client) {
            state.manager.metrics().rate_limited();
            warn!("Rate limited: client={client} path={}", request.uri().path());
            return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
        }
    }
    next.run(request).await
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

async fn list_tools() -> Json<Value> {
    Json(json!({ "tools": Tool::ALL.map(|t| t.as_str()) }))
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.manager.metrics().snapshot())
}

/// WebSocket handler: one session per connection
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    // Browsers always send Origin; non-browser clients may omit it.
    if let Some(origin) = headers.get(header::ORIGIN) {
        let allowed = origin
            .to_str()
            .map(|o| state.origin_allowed(o))
            .unwrap_or(false);
        if !allowed {
            warn!("Refusing WebSocket from origin {origin:?}");
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }

    if state.manager.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let manager = state.manager.clone();
    ws.on_upgrade(move |socket| handle_ws(socket, manager))
}

async fn handle_ws(socket: WebSocket, manager: Arc<SessionManager>) {
    let (sender, receiver) = socket.split();

    let outbound = sender.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));
    let inbound = receiver.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
            Ok(Message::Binary(_)) => Some(Ok(Frame::Binary)),
            Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
            // Pongs are queued by the protocol layer.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(e) => Some(Err(TransportError::Read(e.to_string()))),
        })
    });

    if let Err(e) = manager.serve(inbound, outbound).await {
        debug!("WebSocket session ended with error: {e}");
    }
}
