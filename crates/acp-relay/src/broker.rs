use crate::error::DispatchError;
use crate::registry::{Agent, AgentRegistry};
use acp_core::Envelope;
use serde_json::Value;
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::{sync::oneshot, task::AbortHandle};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

type Outcome = Result<Value, DispatchError>;

pub(crate) struct PendingRequest {
    method: String,
    created_at: Instant,
    completion: oneshot::Sender<Outcome>,
    timeout: AbortHandle,
}

impl PendingRequest {
    fn complete(self, outcome: Outcome) {
        self.timeout.abort();
        let _ = self.completion.send(outcome);
    }
}

/// Outstanding requests of one agent. Sealed once drained on disconnect so a
/// late dispatch cannot park a request nobody will ever answer.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<String, PendingRequest>,
    sealed: bool,
}

impl Agent {
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.entries.len()
    }

    async fn take_pending(&self, id: &str) -> Option<PendingRequest> {
        self.pending.lock().await.entries.remove(id)
    }

    /// Rejects every outstanding request with `AgentDisconnected`.
    pub(crate) async fn cancel_pending(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.pending.lock().await;
            table.sealed = true;
            table.entries.drain().map(|(_, pending)| pending).collect()
        };
        let count = drained.len();
        for pending in drained {
            pending.complete(Err(DispatchError::AgentDisconnected {
                agent_id: self.id.clone(),
            }));
        }
        count
    }
}

/// Resolves to the agent's answer for one dispatched request.
pub struct Completion {
    id: String,
    agent_id: String,
    rx: oneshot::Receiver<Outcome>,
}

impl Completion {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for Completion {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DispatchError::AgentDisconnected {
                agent_id: this.agent_id.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct CommandBroker {
    registry: Arc<AgentRegistry>,
    request_timeout: Duration,
}

impl CommandBroker {
    pub fn new(registry: Arc<AgentRegistry>, request_timeout: Duration) -> Self {
        Self {
            registry,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub async fn dispatch(
        &self,
        agent_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Completion, DispatchError> {
        let agent = self
            .registry
            .lookup(agent_id)
            .await
            .ok_or_else(|| DispatchError::AgentNotFound(agent_id.to_string()))?;
        self.dispatch_to(&agent, method, params).await
    }

    pub async fn dispatch_to(
        &self,
        agent: &Arc<Agent>,
        method: &str,
        params: Value,
    ) -> Result<Completion, DispatchError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut table = agent.pending.lock().await;
            if table.sealed {
                return Err(DispatchError::AgentDisconnected {
                    agent_id: agent.id.clone(),
                });
            }
            let mut id = Uuid::new_v4().to_string();
            while table.entries.contains_key(&id) {
                id = Uuid::new_v4().to_string();
            }
            let timeout = self.spawn_timeout(Arc::downgrade(agent), id.clone());
            table.entries.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    created_at: Instant::now(),
                    completion: tx,
                    timeout,
                },
            );
            id
        };

        debug!(
            event = "request_dispatched",
            agent_id = %agent.id,
            request_id = %id,
            method = method
        );

        if !agent.send(Envelope::request(id.clone(), method, params)).await {
            if let Some(pending) = agent.take_pending(&id).await {
                pending.timeout.abort();
            }
            warn!(event = "request_send_failed", agent_id = %agent.id, request_id = %id);
            return Err(DispatchError::AgentDisconnected {
                agent_id: agent.id.clone(),
            });
        }

        Ok(Completion {
            id,
            agent_id: agent.id.clone(),
            rx,
        })
    }

    /// Dispatches and waits for the outcome.
    pub async fn call(&self, agent_id: &str, method: &str, params: Value) -> Outcome {
        self.dispatch(agent_id, method, params).await?.await
    }

    pub async fn call_agent(&self, agent: &Arc<Agent>, method: &str, params: Value) -> Outcome {
        self.dispatch_to(agent, method, params).await?.await
    }

    /// Completes the pending request an agent's `response` or `error`
    /// envelope refers to. Returns false when nothing was waiting on it.
    pub async fn resolve(&self, agent: &Agent, envelope: &Envelope) -> bool {
        let (id, outcome) = match envelope {
            Envelope::Response(payload) => (payload.id.as_str(), Ok(payload.result.clone())),
            Envelope::Error(payload) => match payload.id.as_deref() {
                Some(id) => (
                    id,
                    Err(DispatchError::Agent {
                        code: payload.error.code.clone(),
                        message: payload.error.message.clone(),
                    }),
                ),
                None => return false,
            },
            _ => return false,
        };

        let Some(pending) = agent.take_pending(id).await else {
            debug!(event = "response_unmatched", agent_id = %agent.id, request_id = id);
            return false;
        };
        debug!(
            event = "request_resolved",
            agent_id = %agent.id,
            request_id = id,
            method = %pending.method,
            ok = outcome.is_ok(),
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64
        );
        pending.complete(outcome);
        true
    }

    fn spawn_timeout(&self, agent: Weak<Agent>, id: String) -> AbortHandle {
        let timeout = self.request_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(agent) = agent.upgrade() else {
                return;
            };
            let Some(pending) = agent.take_pending(&id).await else {
                return;
            };
            warn!(
                event = "request_timeout",
                agent_id = %agent.id,
                request_id = %id,
                method = %pending.method
            );
            let _ = pending.completion.send(Err(DispatchError::RequestTimeout {
                id,
                timeout_ms: timeout.as_millis() as u64,
            }));
        });
        handle.abort_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use crate::test_support::{register_envelope, test_registry};
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn setup(
        timeout: Duration,
    ) -> (
        Arc<AgentRegistry>,
        CommandBroker,
        Arc<Agent>,
        mpsc::Receiver<Outbound>,
    ) {
        let registry = Arc::new(test_registry());
        let broker = CommandBroker::new(registry.clone(), timeout);
        let (tx, rx) = mpsc::channel(16);
        let agent = registry
            .register(tx, &register_envelope("build-box", Some("agt_abc123")))
            .await
            .expect("register");
        (registry, broker, agent, rx)
    }

    fn request_id(outbound: Outbound) -> String {
        match outbound {
            Outbound::Envelope(Envelope::Request(request)) => request.id,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (_registry, broker, agent, mut rx) = setup(DEFAULT_REQUEST_TIMEOUT).await;

        let started = tokio::time::Instant::now();
        let completion = broker
            .dispatch(&agent.id, "tools/list", json!({}))
            .await
            .expect("dispatch");
        let id = request_id(rx.recv().await.expect("request sent"));
        assert_eq!(completion.id(), id);

        let err = completion.await.expect_err("should time out");
        assert!(started.elapsed() >= DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(
            err,
            DispatchError::RequestTimeout {
                id,
                timeout_ms: 30_000
            }
        );
        assert_eq!(agent.pending_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_out_of_order() {
        let (_registry, broker, agent, mut rx) = setup(DEFAULT_REQUEST_TIMEOUT).await;

        let first = broker
            .dispatch(&agent.id, "system_info", json!({}))
            .await
            .expect("first");
        let second = broker
            .dispatch(&agent.id, "wait", json!({"ms": 10}))
            .await
            .expect("second");
        let first_id = request_id(rx.recv().await.expect("first sent"));
        let second_id = request_id(rx.recv().await.expect("second sent"));
        assert_ne!(first_id, second_id);
        assert_eq!(agent.pending_count().await, 2);

        assert!(
            broker
                .resolve(&agent, &Envelope::response(second_id, json!({"waited": 10})))
                .await
        );
        assert_eq!(second.await.expect("second ok"), json!({"waited": 10}));

        assert!(
            broker
                .resolve(
                    &agent,
                    &Envelope::error(Some(first_id), "tool_failed", "no sensors")
                )
                .await
        );
        assert_eq!(
            first.await.expect_err("first failed"),
            DispatchError::Agent {
                code: "tool_failed".to_string(),
                message: "no sensors".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unmatched_response_is_dropped() {
        let (_registry, broker, agent, mut rx) = setup(DEFAULT_REQUEST_TIMEOUT).await;
        let completion = broker
            .dispatch(&agent.id, "tools/list", json!({}))
            .await
            .expect("dispatch");
        let id = request_id(rx.recv().await.expect("sent"));

        assert!(
            !broker
                .resolve(&agent, &Envelope::response("not-a-request", json!(1)))
                .await
        );
        assert!(
            !broker
                .resolve(&agent, &Envelope::error(None, "oops", "no id"))
                .await
        );
        assert_eq!(agent.pending_count().await, 1);

        assert!(broker.resolve(&agent, &Envelope::response(id.clone(), json!([]))).await);
        assert_eq!(completion.await.expect("resolved"), json!([]));
        // A duplicate answer finds nothing left to complete.
        assert!(!broker.resolve(&agent, &Envelope::response(id, json!([]))).await);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_after_timeout_is_ignored() {
        let (_registry, broker, agent, mut rx) = setup(Duration::from_millis(50)).await;
        let completion = broker
            .dispatch(&agent.id, "tools/list", json!({}))
            .await
            .expect("dispatch");
        let id = request_id(rx.recv().await.expect("sent"));

        assert!(matches!(
            completion.await,
            Err(DispatchError::RequestTimeout { .. })
        ));
        assert!(!broker.resolve(&agent, &Envelope::response(id, json!({}))).await);
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found() {
        let (_registry, broker, _agent, _rx) = setup(DEFAULT_REQUEST_TIMEOUT).await;
        let err = broker
            .call("missing", "tools/list", json!({}))
            .await
            .expect_err("no such agent");
        assert_eq!(err, DispatchError::AgentNotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn unregister_rejects_every_outstanding_request() {
        let (registry, broker, agent, _rx) = setup(DEFAULT_REQUEST_TIMEOUT).await;
        let mut completions = Vec::new();
        for index in 0..3 {
            completions.push(
                broker
                    .dispatch(&agent.id, "wait", json!({"ms": index}))
                    .await
                    .expect("dispatch"),
            );
        }

        registry.unregister(&agent.id).await.expect("was registered");
        assert!(registry.lookup(&agent.id).await.is_none());
        for completion in completions {
            assert_eq!(
                completion.await.expect_err("cancelled"),
                DispatchError::AgentDisconnected {
                    agent_id: agent.id.clone()
                }
            );
        }

        // The table is sealed; a late dispatch on the stale handle fails fast.
        let late = broker.dispatch_to(&agent, "tools/list", json!({})).await;
        assert!(matches!(late, Err(DispatchError::AgentDisconnected { .. })));
    }

    #[tokio::test]
    async fn send_failure_reports_disconnect() {
        let (_registry, broker, agent, rx) = setup(DEFAULT_REQUEST_TIMEOUT).await;
        drop(rx);
        let result = broker.dispatch(&agent.id, "tools/list", json!({})).await;
        assert!(matches!(result, Err(DispatchError::AgentDisconnected { .. })));
        assert_eq!(agent.pending_count().await, 0);
    }
}
