use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use tower_http::cors::CorsLayer;

use crate::model::SubscriberId;
use crate::ratelimit::{self, TokenBucket};
use crate::realtime::{ClientSession, HubHandle, SessionConfig};

/// Resolves a session token to a subscriber. Credential issuance and
/// verification live outside this crate.
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<SubscriberId>;
}

/// Fixed token table, loaded from settings.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, SubscriberId>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, SubscriberId>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl SessionAuthenticator for StaticTokenAuthenticator {
    async fn resolve(&self, token: &str) -> Option<SubscriberId> {
        self.tokens.get(token).copied()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub session: SessionConfig,
    pub auth: Arc<dyn SessionAuthenticator>,
    pub limiter: Arc<TokenBucket>,
}

/// `/v1` routes behind the admission gate.
pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/ready", get(ready))
        .route("/ws", get(ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            ratelimit::enforce,
        ))
        .with_state(state);

    Router::new()
        .nest("/v1", v1)
        .layer(CorsLayer::very_permissive())
}

#[derive(serde::Serialize)]
struct ReadyOut {
    status: &'static str,
    clients: usize,
}

async fn ready(State(state): State<AppState>) -> Response {
    match state.hub.stats().await {
        Some(stats) => Json(ReadyOut {
            status: "ok",
            clients: stats.connected,
        })
        .into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "realtime hub is not running"),
    }
}

#[derive(serde::Deserialize)]
struct WsParams {
    token: Option<String>,
}

// Authentication is checked before the upgrade rejection so that a bad
// token is reported as 401 even on a plain HTTP request.
async fn ws_handler(
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = params.token.filter(|t| !t.is_empty()) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing token");
    };
    let Some(subscriber) = state.auth.resolve(&token).await else {
        return error_response(StatusCode::UNAUTHORIZED, "invalid token");
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let session = ClientSession::connect(&state.hub, subscriber, state.session);
        let (sink, stream) = socket.split::<Message>();
        session.run(sink, stream).await;
    })
}

#[derive(serde::Serialize)]
struct ErrorOut {
    error: String,
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    (
        status,
        Json(ErrorOut {
            error: msg.to_string(),
        }),
    )
        .into_response()
}
