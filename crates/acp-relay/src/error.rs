use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("registration rejected: {reason}")]
    Rejected { reason: String },
}

impl RegistrationError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        RegistrationError::Rejected {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            RegistrationError::Rejected { reason } => reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("request {id} timed out after {timeout_ms} ms")]
    RequestTimeout { id: String, timeout_ms: u64 },
    #[error("agent {agent_id} disconnected")]
    AgentDisconnected { agent_id: String },
    #[error("agent error ({code}): {message}")]
    Agent { code: String, message: String },
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::AgentNotFound(_) => "agent_not_found",
            DispatchError::RequestTimeout { .. } => "request_timeout",
            DispatchError::AgentDisconnected { .. } => "agent_disconnected",
            DispatchError::Agent { .. } => "agent_error",
        }
    }
}
