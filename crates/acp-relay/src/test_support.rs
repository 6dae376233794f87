use crate::auth::PrefixAuthenticator;
use crate::presence::LogPresence;
use crate::registry::AgentRegistry;
use acp_core::{Envelope, RegisterPayload};
use std::sync::Arc;

pub(crate) fn test_registry() -> AgentRegistry {
    AgentRegistry::new(
        Arc::new(PrefixAuthenticator::default()),
        Arc::new(LogPresence),
    )
}

pub(crate) fn register_envelope(name: &str, token: Option<&str>) -> Envelope {
    Envelope::Register(RegisterPayload {
        machine_id: format!("{name}-machine"),
        machine_name: name.to_string(),
        os_type: "linux".to_string(),
        os_version: "Ubuntu 24.04 LTS".to_string(),
        arch: "x64".to_string(),
        agent_version: "0.1.0".to_string(),
        token: token.map(str::to_string),
        ..RegisterPayload::default()
    })
}
