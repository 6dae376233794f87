use crate::broker::CommandBroker;
use crate::error::DispatchError;
use crate::registry::AgentRegistry;
use acp_core::rpc::MCP_PROTOCOL_VERSION;
use acp_core::{ErrorCode, RpcError, RpcRequest, RpcResponse};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub const SERVER_NAME: &str = "acp-relay";

/// JSON-RPC front door for tool clients. Everything agent-specific is
/// forwarded untouched to the agent through the broker.
pub struct ProtocolFacade {
    registry: Arc<AgentRegistry>,
    broker: Arc<CommandBroker>,
}

impl ProtocolFacade {
    pub fn new(registry: Arc<AgentRegistry>, broker: Arc<CommandBroker>) -> Self {
        Self { registry, broker }
    }

    /// Handles one raw request body. `None` means the body was a notification
    /// and gets no reply.
    pub async fn handle(&self, body: &[u8]) -> Option<RpcResponse> {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(err) => {
                return Some(RpcResponse::failure(
                    Value::Null,
                    RpcError::new(ErrorCode::ParseError, format!("parse error: {err}")),
                ))
            }
        };
        let request: RpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(err) => {
                return Some(RpcResponse::failure(
                    Value::Null,
                    RpcError::new(ErrorCode::ParseError, format!("invalid request: {err}")),
                ))
            }
        };
        self.call(request).await
    }

    pub async fn call(&self, request: RpcRequest) -> Option<RpcResponse> {
        let Some(id) = request.id.clone() else {
            debug!(event = "rpc_notification", method = %request.method);
            return None;
        };
        let response = match self.route(&request).await {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => RpcResponse::failure(id, error),
        };
        Some(response)
    }

    async fn route(&self, request: &RpcRequest) -> Result<Value, RpcError> {
        match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            "ping" => Ok(json!({})),
            "tools/list" | "tools/call" => self.forward(request).await,
            other => Err(RpcError::new(
                ErrorCode::MethodNotFound,
                format!("method not found: {other}"),
            )),
        }
    }

    async fn forward(&self, request: &RpcRequest) -> Result<Value, RpcError> {
        let params = request.params.clone().unwrap_or_else(|| json!({}));
        let outcome = if let Some(agent_id) = request.param_str("agentId") {
            self.broker.call(agent_id, &request.method, params).await
        } else if let Some(name) = request.param_str("agentName") {
            match self.registry.lookup_by_name(name).await {
                Some(agent) => self.broker.call_agent(&agent, &request.method, params).await,
                None => Err(DispatchError::AgentNotFound(name.to_string())),
            }
        } else {
            return Err(RpcError::new(
                ErrorCode::InvalidParams,
                "agentId or agentName is required",
            ));
        };
        outcome.map_err(|err| RpcError::new(ErrorCode::InternalError, err.to_string()))
    }
}
