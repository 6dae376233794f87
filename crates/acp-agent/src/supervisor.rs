use crate::handler::CommandHandler;
use crate::transport::{
    connect, AgentTransport, ConnectOptions, DisconnectReason, TransportEvent, TransportHandle,
};
use acp_core::RegisterPayload;
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const EVENT_QUEUE: usize = 64;

/// Everything the supervisor needs to keep a session alive.
pub struct Session {
    pub server_url: String,
    pub register: RegisterPayload,
    pub handler: Arc<dyn CommandHandler>,
    pub reconnect_delay: Duration,
    pub options: ConnectOptions,
}

enum Outcome {
    Disconnected { registered: bool },
    Shutdown,
}

/// Connects, serves requests and reconnects with backoff until `shutdown`
/// resolves.
pub async fn run<F>(session: Session, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut backoff = session.reconnect_delay;
    loop {
        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE);
        let connect_attempt = connect(
            &session.server_url,
            session.register.clone(),
            tx,
            session.options.clone(),
        );
        let transport = tokio::select! {
            result = connect_attempt => result,
            _ = &mut shutdown => return,
        };
        match transport {
            Ok(transport) => {
                let outcome = drive(&transport, &mut rx, &session.handler, &mut shutdown).await;
                match outcome {
                    Outcome::Shutdown => {
                        info!(event = "agent_shutdown");
                        transport.close().await;
                        return;
                    }
                    Outcome::Disconnected { registered } => {
                        transport.join().await;
                        if registered {
                            backoff = session.reconnect_delay;
                        }
                    }
                }
            }
            Err(err) => warn!(event = "connect_error", url = %session.server_url, error = %err),
        }

        info!(event = "reconnect_wait", delay_ms = backoff.as_millis() as u64);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = &mut shutdown => return,
        }
        backoff = next_backoff(backoff);
    }
}

async fn drive<F>(
    transport: &AgentTransport,
    rx: &mut mpsc::Receiver<TransportEvent>,
    handler: &Arc<dyn CommandHandler>,
    shutdown: &mut std::pin::Pin<&mut F>,
) -> Outcome
where
    F: Future<Output = ()>,
{
    let mut registered = false;
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = shutdown.as_mut() => return Outcome::Shutdown,
        };
        match event {
            Some(TransportEvent::Registered {
                agent_id,
                license_status,
                ..
            }) => {
                registered = true;
                info!(event = "session_ready", agent_id = %agent_id, license_status = %license_status);
            }
            Some(TransportEvent::LicenseStatus(status)) => {
                debug!(event = "license_status", status = %status);
            }
            Some(TransportEvent::Request { id, method, params }) => {
                tokio::spawn(execute(
                    transport.handle(),
                    handler.clone(),
                    id,
                    method,
                    params,
                ));
            }
            Some(TransportEvent::State(state)) => debug!(event = "transport_state", state = ?state),
            Some(TransportEvent::Disconnected(reason)) => {
                if let DisconnectReason::Rejected { code, message } = &reason {
                    warn!(event = "registration_rejected", code = %code, message = %message);
                }
                return Outcome::Disconnected { registered };
            }
            None => return Outcome::Disconnected { registered },
        }
    }
}

async fn execute(
    handle: TransportHandle,
    handler: Arc<dyn CommandHandler>,
    id: String,
    method: String,
    params: Value,
) {
    let task_method = method.clone();
    let outcome =
        tokio::task::spawn_blocking(move || handler.handle(&task_method, &params)).await;
    let sent = match outcome {
        Ok(Ok(result)) => handle.send_response(&id, result).await,
        Ok(Err(failure)) => handle.send_error(&id, &failure.code, &failure.message).await,
        Err(err) => {
            handle
                .send_error(&id, "internal_error", &format!("handler panicked: {err}"))
                .await
        }
    };
    if let Err(err) = sent {
        warn!(event = "reply_error", request_id = %id, method = %method, error = %err);
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_RECONNECT_DELAY {
        MAX_RECONNECT_DELAY
    } else {
        next
    }
}
