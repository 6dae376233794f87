use crate::registry::Agent;
use acp_core::RpcNotification;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Connected,
    Disconnected,
}

impl AgentEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentEvent::Connected => "connected",
            AgentEvent::Disconnected => "disconnected",
        }
    }
}

struct Subscription {
    endpoint: String,
    sender: mpsc::Sender<Value>,
}

/// Fan-out of server-initiated notifications to push subscribers, grouped by
/// endpoint.
pub struct NotificationHub {
    counter: AtomicU64,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("sub-{id}")
    }

    pub async fn subscribe(&self, endpoint: &str, sender: mpsc::Sender<Value>) -> String {
        let id = self.next_id();
        self.subscriptions.write().await.insert(
            id.clone(),
            Subscription {
                endpoint: endpoint.to_string(),
                sender,
            },
        );
        info!(event = "subscription_open", subscription_id = %id, endpoint = endpoint);
        id
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self
            .subscriptions
            .write()
            .await
            .remove(subscription_id)
            .is_some();
        if removed {
            info!(event = "subscription_closed", subscription_id = subscription_id);
        }
        removed
    }

    /// Pushes to every subscriber of `endpoint` and returns how many accepted
    /// it. Subscribers whose channel is closed or full are dropped.
    pub async fn broadcast(&self, endpoint: &str, notification: &Value) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let subscriptions = self.subscriptions.read().await;
            for (id, subscription) in subscriptions.iter() {
                if subscription.endpoint != endpoint {
                    continue;
                }
                match subscription.sender.try_send(notification.clone()) {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        warn!(event = "push_error", subscription_id = %id, error = %err);
                        failed.push(id.clone());
                    }
                }
            }
        }
        if !failed.is_empty() {
            let mut subscriptions = self.subscriptions.write().await;
            for id in &failed {
                subscriptions.remove(id);
            }
        }
        debug!(
            event = "broadcast",
            endpoint = endpoint,
            delivered = delivered,
            dropped = failed.len()
        );
        delivered
    }

    pub async fn subscriber_count(&self, endpoint: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|subscription| subscription.endpoint == endpoint)
            .count()
    }

    /// Announces an agent joining or leaving on its endpoint.
    pub async fn publish_agent_event(&self, agent: &Agent, event: AgentEvent) -> usize {
        let notification = RpcNotification::new(
            TOOLS_LIST_CHANGED,
            json!({
                "agentId": agent.id,
                "agentName": agent.name,
                "event": event.as_str(),
            }),
        );
        match serde_json::to_value(&notification) {
            Ok(value) => self.broadcast(&agent.endpoint, &value).await,
            Err(err) => {
                warn!(event = "notification_encode", error = %err);
                0
            }
        }
    }

    /// Ties a subscription's lifetime to the returned guard.
    pub fn guard(self: &Arc<Self>, subscription_id: String) -> SubscriptionGuard {
        SubscriptionGuard {
            hub: self.clone(),
            subscription_id,
        }
    }
}

pub struct SubscriptionGuard {
    hub: Arc<NotificationHub>,
    subscription_id: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let id = std::mem::take(&mut self.subscription_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                hub.unsubscribe(&id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_subscriber_is_dropped_and_others_still_receive() {
        let hub = NotificationHub::new();
        let (live_tx, mut live_rx) = mpsc::channel(4);
        let (dead_tx, dead_rx) = mpsc::channel(4);
        let (full_tx, _full_rx) = mpsc::channel(1);
        let (other_tx, mut other_rx) = mpsc::channel(4);
        hub.subscribe("cust-1", live_tx).await;
        hub.subscribe("cust-1", dead_tx).await;
        let full_id = hub.subscribe("cust-1", full_tx.clone()).await;
        hub.subscribe("cust-2", other_tx).await;
        drop(dead_rx);
        full_tx.try_send(json!("filler")).expect("fill");

        let delivered = hub.broadcast("cust-1", &json!({"n": 1})).await;
        assert_eq!(delivered, 1);
        assert_eq!(live_rx.recv().await, Some(json!({"n": 1})));
        assert_eq!(hub.subscriber_count("cust-1").await, 1);
        assert!(!hub.unsubscribe(&full_id).await);
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_a_no_op() {
        let hub = NotificationHub::new();
        assert_eq!(hub.broadcast("default", &json!({})).await, 0);
        assert_eq!(hub.subscriber_count("default").await, 0);
    }

    #[tokio::test]
    async fn dropping_guard_unsubscribes() {
        let hub = Arc::new(NotificationHub::new());
        let (tx, _rx) = mpsc::channel(4);
        let id = hub.subscribe("default", tx).await;
        let guard = hub.guard(id);
        assert_eq!(hub.subscriber_count("default").await, 1);

        drop(guard);
        for _ in 0..10 {
            if hub.subscriber_count("default").await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.subscriber_count("default").await, 0);
    }
}
