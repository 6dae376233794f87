use crate::auth::{AuthDecision, Authenticator};
use crate::broker::PendingTable;
use crate::error::RegistrationError;
use crate::presence::Presence;
use acp_core::{Envelope, Fingerprint};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_ENDPOINT: &str = "default";

/// What the session writer task puts on the wire for an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

pub struct Agent {
    pub id: String,
    pub name: String,
    pub machine_id: String,
    pub os_type: String,
    pub os_version: String,
    pub arch: String,
    pub agent_version: String,
    pub customer_id: Option<String>,
    pub license_uuid: Option<String>,
    pub fingerprint: Fingerprint,
    pub license_status: String,
    /// Notification endpoint this agent's lifecycle events are published to.
    pub endpoint: String,
    pub connected_at: DateTime<Utc>,
    credential: Option<String>,
    last_heartbeat_at: RwLock<DateTime<Utc>>,
    outbound: mpsc::Sender<Outbound>,
    evicted: Notify,
    pub(crate) pending: Mutex<PendingTable>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub async fn last_heartbeat_at(&self) -> DateTime<Utc> {
        *self.last_heartbeat_at.read().await
    }

    /// Queues an envelope for the agent. Returns false once the connection's
    /// writer has gone away.
    pub async fn send(&self, envelope: Envelope) -> bool {
        self.outbound
            .send(Outbound::Envelope(envelope))
            .await
            .is_ok()
    }

    /// Queues a close frame and tells the connection's read loop to stop
    /// waiting on the peer.
    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .outbound
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
        self.evicted.notify_one();
    }

    /// Resolves once `close` has been called, including calls made before
    /// this future was created.
    pub async fn closed(&self) {
        self.evicted.notified().await;
    }

    pub async fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            machine_id: self.machine_id.clone(),
            os_type: self.os_type.clone(),
            os_version: self.os_version.clone(),
            arch: self.arch.clone(),
            agent_version: self.agent_version.clone(),
            customer_id: self.customer_id.clone(),
            license_status: self.license_status.clone(),
            endpoint: self.endpoint.clone(),
            connected_at: self.connected_at,
            last_heartbeat_at: self.last_heartbeat_at().await,
            pending_requests: self.pending_count().await,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub machine_id: String,
    pub os_type: String,
    pub os_version: String,
    pub arch: String,
    pub agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub license_status: String,
    pub endpoint: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub pending_requests: usize,
}

/// Table of connected agents keyed by relay-assigned id.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<Agent>>>,
    authenticator: Arc<dyn Authenticator>,
    presence: Arc<dyn Presence>,
}

impl AgentRegistry {
    pub fn new(authenticator: Arc<dyn Authenticator>, presence: Arc<dyn Presence>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            authenticator,
            presence,
        }
    }

    pub async fn register(
        &self,
        outbound: mpsc::Sender<Outbound>,
        envelope: &Envelope,
    ) -> Result<Arc<Agent>, RegistrationError> {
        let Envelope::Register(payload) = envelope else {
            return Err(RegistrationError::rejected(format!(
                "expected register, got {}",
                envelope.kind()
            )));
        };
        if payload.machine_id.trim().is_empty() || payload.machine_name.trim().is_empty() {
            return Err(RegistrationError::rejected("missing machine identity"));
        }

        let license_status = match self.authenticator.validate(payload.credential()) {
            AuthDecision::Allow { license_status } => license_status,
            AuthDecision::Deny { reason } => {
                warn!(
                    event = "registration_denied",
                    machine_id = %payload.machine_id,
                    reason = %reason
                );
                return Err(RegistrationError::Rejected { reason });
            }
        };

        let now = Utc::now();
        let endpoint = payload
            .customer_id
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let agent = Arc::new(Agent {
            id: Uuid::new_v4().to_string(),
            name: payload.machine_name.clone(),
            machine_id: payload.machine_id.clone(),
            os_type: payload.os_type.clone(),
            os_version: payload.os_version.clone(),
            arch: payload.arch.clone(),
            agent_version: payload.agent_version.clone(),
            customer_id: payload.customer_id.clone(),
            license_uuid: payload.license_uuid.clone(),
            fingerprint: payload.fingerprint.clone(),
            license_status,
            endpoint,
            connected_at: now,
            credential: payload.credential().map(str::to_string),
            last_heartbeat_at: RwLock::new(now),
            outbound,
            evicted: Notify::new(),
            pending: Mutex::new(PendingTable::default()),
        });

        self.agents
            .write()
            .await
            .insert(agent.id.clone(), agent.clone());

        info!(
            event = "agent_registered",
            agent_id = %agent.id,
            name = %agent.name,
            machine_id = %agent.machine_id,
            os = %agent.os_type,
            arch = %agent.arch
        );
        self.presence.announce(&agent.summary().await);
        Ok(agent)
    }

    /// Removes the agent and rejects everything still waiting on it.
    pub async fn unregister(&self, agent_id: &str) -> Option<Arc<Agent>> {
        let agent = self.agents.write().await.remove(agent_id)?;
        let cancelled = agent.cancel_pending().await;
        self.presence.withdraw(&agent.id);
        info!(
            event = "agent_unregistered",
            agent_id = %agent.id,
            name = %agent.name,
            cancelled = cancelled
        );
        Some(agent)
    }

    pub async fn lookup(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Names are not unique; the earliest connected agent wins.
    pub async fn lookup_by_name(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents
            .read()
            .await
            .values()
            .filter(|agent| agent.name == name)
            .min_by_key(|agent| agent.connected_at)
            .cloned()
    }

    pub async fn record_heartbeat(&self, agent: &Agent) {
        *agent.last_heartbeat_at.write().await = Utc::now();
    }

    pub async fn list(&self) -> Vec<Arc<Agent>> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by_key(|agent| agent.connected_at);
        agents
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Agents whose last heartbeat is older than `max_age`.
    pub async fn stale_agents(&self, max_age: Duration) -> Vec<Arc<Agent>> {
        let now = Utc::now();
        let mut stale = Vec::new();
        for agent in self.list().await {
            let age = (now - agent.last_heartbeat_at().await).to_std();
            if matches!(age, Ok(age) if age > max_age) {
                stale.push(agent);
            }
        }
        stale
    }
}
