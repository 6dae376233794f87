use crate::error::DispatchError;
use crate::registry::{AgentSummary, DEFAULT_ENDPOINT};
use crate::session::handle_socket;
use crate::RelayState;
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

const EVENT_QUEUE: usize = 64;

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/agents", get(list_agents))
        .route("/agents/:id", get(agent_status))
        .route("/agents/:id/*method", post(call_agent))
        .route("/by-name/:name", get(agent_status_by_name))
        .route("/by-name/:name/*method", post(call_agent_by_name))
        .route("/mcp", post(mcp))
        .route("/mcp/events", get(events))
        .route("/mcp/:endpoint", post(mcp_endpoint))
        .route("/mcp/:endpoint/events", get(endpoint_events))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket, addr))
}

async fn list_agents(State(state): State<Arc<RelayState>>) -> Json<Vec<AgentSummary>> {
    let mut summaries = Vec::new();
    for agent in state.registry.list().await {
        summaries.push(agent.summary().await);
    }
    Json(summaries)
}

async fn agent_status(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<String>,
) -> Result<Json<AgentSummary>, ApiError> {
    let agent = state
        .registry
        .lookup(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("agent not found: {id}")))?;
    Ok(Json(agent.summary().await))
}

async fn agent_status_by_name(
    State(state): State<Arc<RelayState>>,
    Path(name): Path<String>,
) -> Result<Json<AgentSummary>, ApiError> {
    let agent = state
        .registry
        .lookup_by_name(&name)
        .await
        .ok_or_else(|| ApiError::not_found(format!("agent not found: {name}")))?;
    Ok(Json(agent.summary().await))
}

async fn call_agent(
    State(state): State<Arc<RelayState>>,
    Path((id, method)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let params = parse_params(&body)?;
    let result = state
        .broker
        .call(&id, method.trim_start_matches('/'), params)
        .await
        .map_err(ApiError::from_dispatch)?;
    Ok(Json(result))
}

async fn call_agent_by_name(
    State(state): State<Arc<RelayState>>,
    Path((name, method)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let params = parse_params(&body)?;
    let agent = state
        .registry
        .lookup_by_name(&name)
        .await
        .ok_or_else(|| ApiError::not_found(format!("agent not found: {name}")))?;
    let result = state
        .broker
        .call_agent(&agent, method.trim_start_matches('/'), params)
        .await
        .map_err(ApiError::from_dispatch)?;
    Ok(Json(result))
}

async fn mcp(State(state): State<Arc<RelayState>>, body: Bytes) -> Response {
    rpc_reply(&state, &body).await
}

async fn mcp_endpoint(
    State(state): State<Arc<RelayState>>,
    Path(_endpoint): Path<String>,
    body: Bytes,
) -> Response {
    rpc_reply(&state, &body).await
}

async fn rpc_reply(state: &RelayState, body: &[u8]) -> Response {
    match state.facade.handle(body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn events(State(state): State<Arc<RelayState>>) -> Response {
    subscribe(state, DEFAULT_ENDPOINT).await
}

async fn endpoint_events(
    State(state): State<Arc<RelayState>>,
    Path(endpoint): Path<String>,
) -> Response {
    subscribe(state, &endpoint).await
}

async fn subscribe(state: Arc<RelayState>, endpoint: &str) -> Response {
    let (tx, rx) = mpsc::channel::<Value>(EVENT_QUEUE);
    let id = state.notifications.subscribe(endpoint, tx).await;
    let guard = state.notifications.guard(id);
    let stream = ReceiverStream::new(rx).map(move |value| {
        let _subscription = &guard;
        Ok::<Event, Infallible>(Event::default().data(value.to_string()))
    });
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.config.sse_ping_interval)
                .text("ping"),
        )
        .into_response()
}

fn parse_params(body: &[u8]) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|err| ApiError::bad_request(format!("invalid body: {err}")))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn from_dispatch(err: DispatchError) -> Self {
        let status = match err {
            DispatchError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::AgentDisconnected { .. } | DispatchError::Agent { .. } => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = Json(json!({
            "error": self.message,
        }))
        .into_response();
        *response.status_mut() = self.status;
        response
    }
}
