use crate::registry::AgentSummary;
use tracing::info;

/// Publishes agent availability to whatever discovery mechanism the
/// deployment uses.
pub trait Presence: Send + Sync {
    fn announce(&self, agent: &AgentSummary);
    fn withdraw(&self, agent_id: &str);
}

/// Default collaborator: records presence changes in the relay log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPresence;

impl Presence for LogPresence {
    fn announce(&self, agent: &AgentSummary) {
        info!(
            event = "presence_announce",
            agent_id = %agent.id,
            name = %agent.name,
            os = %agent.os_type
        );
    }

    fn withdraw(&self, agent_id: &str) {
        info!(event = "presence_withdraw", agent_id = agent_id);
    }
}
