//! Relay side of the agent control protocol: accepts agent WebSocket
//! sessions, tracks them in a registry, correlates commands with their
//! responses and exposes everything over HTTP and a JSON-RPC façade.

pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod facade;
pub mod http;
pub mod logging;
pub mod notify;
pub mod presence;
pub mod registry;
pub mod session;

#[cfg(test)]
mod test_support;

use crate::auth::{Authenticator, PrefixAuthenticator};
use crate::broker::CommandBroker;
use crate::config::RelayConfig;
use crate::facade::ProtocolFacade;
use crate::notify::{AgentEvent, NotificationHub};
use crate::presence::{LogPresence, Presence};
use crate::registry::AgentRegistry;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use crate::error::{DispatchError, RegistrationError};

/// Process-wide relay state shared by every connection and HTTP handler.
pub struct RelayState {
    pub config: RelayConfig,
    pub registry: Arc<AgentRegistry>,
    pub broker: Arc<CommandBroker>,
    pub facade: ProtocolFacade,
    pub notifications: Arc<NotificationHub>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let authenticator = Arc::new(PrefixAuthenticator::new(config.token_prefix.clone()));
        Self::with_collaborators(config, authenticator, Arc::new(LogPresence))
    }

    pub fn with_collaborators(
        config: RelayConfig,
        authenticator: Arc<dyn Authenticator>,
        presence: Arc<dyn Presence>,
    ) -> Self {
        let registry = Arc::new(AgentRegistry::new(authenticator, presence));
        let broker = Arc::new(CommandBroker::new(
            registry.clone(),
            config.request_timeout,
        ));
        let facade = ProtocolFacade::new(registry.clone(), broker.clone());
        Self {
            config,
            registry,
            broker,
            facade,
            notifications: Arc::new(NotificationHub::new()),
        }
    }

    /// Evicts agents that stopped heartbeating. Disabled when
    /// `stale_seconds` is zero.
    pub fn start_stale_reaper(self: Arc<Self>) {
        if self.config.stale_seconds == 0 {
            return;
        }
        let stale_after = Duration::from_secs(self.config.stale_seconds);
        let interval = stale_after / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for agent in self.registry.stale_agents(stale_after).await {
                    warn!(event = "stale_close", agent_id = %agent.id);
                    if self.registry.unregister(&agent.id).await.is_some() {
                        agent
                            .close(acp_core::frame::CLOSE_NORMAL, "heartbeat timeout")
                            .await;
                        self.notifications
                            .publish_agent_event(&agent, AgentEvent::Disconnected)
                            .await;
                    }
                }
            }
        });
    }
}

/// Serves the relay on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<RelayState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    state.clone().start_stale_reaper();
    let app = http::router(state);
    if let Ok(addr) = listener.local_addr() {
        info!(event = "relay_start", addr = %addr);
    }
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
