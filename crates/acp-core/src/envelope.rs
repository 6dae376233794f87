use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_POWER_STATE: &str = "ACTIVE";

/// Typed JSON message carried in one text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Register(RegisterPayload),
    Registered(RegisteredPayload),
    Heartbeat(HeartbeatPayload),
    HeartbeatAck(HeartbeatAckPayload),
    Request(RequestPayload),
    Response(ResponsePayload),
    Error(ErrorPayload),
    Ping(PingPayload),
    Pong(PingPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub machine_id: String,
    pub machine_name: String,
    #[serde(default)]
    pub os_type: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub fingerprint: Fingerprint,
}

impl RegisterPayload {
    /// The bearer credential presented by the agent: an explicit token, or
    /// the license uuid for agents provisioned without one.
    pub fn credential(&self) -> Option<&str> {
        self.token
            .as_deref()
            .or(self.license_uuid.as_deref())
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub cpu_model: String,
    #[serde(default)]
    pub mac_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub agent_id: String,
    pub license_status: String,
    #[serde(default)]
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_interval
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub timestamp: i64,
    #[serde(default = "default_power_state")]
    pub power_state: String,
    #[serde(default)]
    pub is_screen_locked: bool,
}

impl HeartbeatPayload {
    pub fn now(is_screen_locked: bool) -> Self {
        Self {
            timestamp: now_ms(),
            power_state: DEFAULT_POWER_STATE.to_string(),
            is_screen_locked,
        }
    }
}

fn default_power_state() -> String {
    DEFAULT_POWER_STATE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAckPayload {
    pub license_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestPayload {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    pub id: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub error: WireError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    #[serde(default)]
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("envelope decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

impl Envelope {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Envelope::Request(RequestPayload {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Envelope::Response(ResponsePayload {
            id: id.into(),
            result,
        })
    }

    pub fn error(id: Option<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Envelope::Error(ErrorPayload {
            id,
            error: WireError {
                code: code.into(),
                message: message.into(),
            },
        })
    }

    pub fn ping() -> Self {
        Envelope::Ping(PingPayload {
            timestamp: Some(now_ms()),
        })
    }

    pub fn pong() -> Self {
        Envelope::Pong(PingPayload {
            timestamp: Some(now_ms()),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register(_) => "register",
            Envelope::Registered(_) => "registered",
            Envelope::Heartbeat(_) => "heartbeat",
            Envelope::HeartbeatAck(_) => "heartbeat_ack",
            Envelope::Request(_) => "request",
            Envelope::Response(_) => "response",
            Envelope::Error(_) => "error",
            Envelope::Ping(_) => "ping",
            Envelope::Pong(_) => "pong",
        }
    }

    /// Correlation id for request/response/error envelopes.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Envelope::Request(payload) => Some(payload.id.as_str()),
            Envelope::Response(payload) => Some(payload.id.as_str()),
            Envelope::Error(payload) => payload.id.as_deref(),
            _ => None,
        }
    }

    pub fn to_text(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_text(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(EnvelopeError::Decode)
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
