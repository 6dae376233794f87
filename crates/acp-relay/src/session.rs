use crate::notify::AgentEvent;
use crate::registry::{Agent, Outbound};
use crate::RelayState;
use acp_core::frame::{CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use acp_core::{Envelope, HeartbeatAckPayload, RegisteredPayload, SessionConfig};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 256;

/// Drives one agent connection: registration first, then the message loop
/// until the socket goes away.
pub async fn handle_socket(state: Arc<RelayState>, socket: WebSocket, remote: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let write_timeout = state.config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let (msg, closing) = match outbound {
                Outbound::Envelope(envelope) => match envelope.to_text() {
                    Ok(text) => (Message::Text(text), false),
                    Err(err) => {
                        warn!(event = "encode_error", error = %err);
                        continue;
                    }
                },
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    true,
                ),
            };
            match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) if !closing => {}
                _ => return,
            }
        }
    });
    let writer = write_task.abort_handle();

    let Some(agent) = register(&state, &mut ws_receiver, &tx, remote).await else {
        drop(tx);
        let _ = tokio::time::timeout(write_timeout, write_task).await;
        writer.abort();
        return;
    };

    loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            _ = agent.closed() => {
                info!(event = "agent_evicted", agent_id = %agent.id);
                break;
            }
        };
        let Some(result) = next else {
            break;
        };
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", agent_id = %agent.id, error = %err);
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(_) => {
                warn!(event = "binary_ignored", agent_id = %agent.id);
                continue;
            }
            Message::Ping(_) | Message::Pong(_) => {
                state.registry.record_heartbeat(&agent).await;
                continue;
            }
            Message::Close(_) => {
                info!(event = "agent_close", agent_id = %agent.id);
                break;
            }
        };
        if state.config.debug {
            debug!(event = "message_received", agent_id = %agent.id, raw = %text);
        }
        match Envelope::from_text(&text) {
            Ok(envelope) => handle_envelope(&state, &agent, envelope).await,
            Err(err) => warn!(event = "message_invalid", agent_id = %agent.id, error = %err),
        }
    }

    if state.registry.unregister(&agent.id).await.is_some() {
        state
            .notifications
            .publish_agent_event(&agent, AgentEvent::Disconnected)
            .await;
    }
    let _ = tx.try_send(Outbound::Close {
        code: CLOSE_NORMAL,
        reason: "disconnect".to_string(),
    });
    drop(tx);
    let _ = tokio::time::timeout(write_timeout, write_task).await;
    writer.abort();
}

async fn register(
    state: &RelayState,
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::Sender<Outbound>,
    remote: SocketAddr,
) -> Option<Arc<Agent>> {
    let deadline = tokio::time::Instant::now() + state.config.register_timeout;
    let first = loop {
        match tokio::time::timeout_at(deadline, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => break text,
            // Control frames may precede the register message.
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(Some(Ok(_))) => {
                warn!(event = "expected_register", remote = %remote);
                reject(tx, "expected a register message").await;
                return None;
            }
            Ok(_) => return None,
            Err(_) => {
                warn!(event = "register_timeout", remote = %remote);
                reject(tx, "registration timed out").await;
                return None;
            }
        }
    };

    let envelope = match Envelope::from_text(&first) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(event = "register_parse", remote = %remote, error = %err);
            reject(tx, "malformed register message").await;
            return None;
        }
    };

    let agent = match state.registry.register(tx.clone(), &envelope).await {
        Ok(agent) => agent,
        Err(err) => {
            warn!(event = "register_rejected", remote = %remote, reason = err.reason());
            reject(tx, err.reason()).await;
            return None;
        }
    };

    let registered = Envelope::Registered(RegisteredPayload {
        agent_id: agent.id.clone(),
        license_status: agent.license_status.clone(),
        config: SessionConfig {
            heartbeat_interval: Some(state.config.heartbeat_interval.as_millis() as u64),
        },
    });
    if !agent.send(registered).await {
        state.registry.unregister(&agent.id).await;
        return None;
    }
    info!(event = "handshake_ok", agent_id = %agent.id, remote = %remote);
    state
        .notifications
        .publish_agent_event(&agent, AgentEvent::Connected)
        .await;
    Some(agent)
}

async fn reject(tx: &mpsc::Sender<Outbound>, reason: &str) {
    let _ = tx
        .send(Outbound::Envelope(Envelope::error(
            None,
            "registration_rejected",
            reason,
        )))
        .await;
    let _ = tx
        .send(Outbound::Close {
            code: CLOSE_POLICY_VIOLATION,
            reason: "registration rejected".to_string(),
        })
        .await;
}

async fn handle_envelope(state: &RelayState, agent: &Arc<Agent>, envelope: Envelope) {
    match envelope {
        Envelope::Heartbeat(_) => {
            state.registry.record_heartbeat(agent).await;
            agent
                .send(Envelope::HeartbeatAck(HeartbeatAckPayload {
                    license_status: agent.license_status.clone(),
                }))
                .await;
        }
        Envelope::Response(_) | Envelope::Error(_) => {
            state.broker.resolve(agent, &envelope).await;
        }
        Envelope::Ping(_) => {
            agent.send(Envelope::pong()).await;
        }
        Envelope::Pong(_) => {
            state.registry.record_heartbeat(agent).await;
        }
        Envelope::Register(_) => {
            warn!(event = "duplicate_register", agent_id = %agent.id);
            agent
                .send(Envelope::error(
                    None,
                    "already_registered",
                    "connection is already registered",
                ))
                .await;
        }
        other => {
            warn!(event = "unexpected_envelope", agent_id = %agent.id, kind = other.kind());
        }
    }
}
