use crate::handshake::{self, HandshakeError, ServerTarget};
use crate::machine;
use acp_core::frame::{close_payload, encode, parse_close_payload, CLOSE_NORMAL};
use acp_core::{
    Envelope, EnvelopeError, Frame, FrameDecoder, FrameError, HeartbeatPayload, Opcode,
    RegisterPayload, Role, DEFAULT_MAX_PAYLOAD_BYTES,
};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_rustls::{
    rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 16 * 1024;

pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

type BoxedStream = Box<dyn IoStream>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("connection is closed")]
    Closed,
    #[error("timed out connecting to {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    TransportHandshake,
    ProtocolUpgrade,
    Registered,
    Heartbeating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The relay sent a close frame.
    Closed { code: Option<u16>, reason: String },
    /// The relay refused the registration before closing.
    Rejected { code: String, message: String },
    Eof,
    /// `close()` was called on this side.
    Local,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    State(ConnectionState),
    Registered {
        agent_id: String,
        license_status: String,
        heartbeat_interval: Duration,
    },
    LicenseStatus(String),
    Request {
        id: String,
        method: String,
        params: Value,
    },
    Disconnected(DisconnectReason),
}

#[derive(Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub max_payload: usize,
    pub screen_lock_probe: fn() -> bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            max_payload: DEFAULT_MAX_PAYLOAD_BYTES,
            screen_lock_probe: machine::is_screen_locked,
        }
    }
}

/// Write side of a connection. Every outbound frame goes through the one
/// writer lock; the read loop never takes it except to answer the relay.
#[derive(Clone)]
pub struct TransportHandle {
    writer: Arc<Mutex<Option<WriteHalf<BoxedStream>>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl TransportHandle {
    async fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or(TransportError::Closed)?;
        half.write_all(&encode(opcode, payload, Role::Client)).await?;
        half.flush().await?;
        Ok(())
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = envelope.to_text()?;
        self.write_frame(Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_response(&self, id: &str, result: Value) -> Result<(), TransportError> {
        self.send(&Envelope::response(id, result)).await
    }

    pub async fn send_error(&self, id: &str, code: &str, message: &str) -> Result<(), TransportError> {
        self.send(&Envelope::error(Some(id.to_string()), code, message))
            .await
    }

    /// Sends a normal-closure frame and stops the read loop.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut half) = writer.take() {
            let frame = encode(
                Opcode::Close,
                &close_payload(CLOSE_NORMAL, "agent closing"),
                Role::Client,
            );
            let _ = half.write_all(&frame).await;
            let _ = half.shutdown().await;
        }
        self.shutdown.send_replace(true);
    }

    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }

    async fn release(&self) {
        if let Some(mut half) = self.writer.lock().await.take() {
            let _ = half.shutdown().await;
        }
    }
}

/// A live, registered-or-registering connection to the relay.
pub struct AgentTransport {
    handle: TransportHandle,
    reader: JoinHandle<()>,
}

impl AgentTransport {
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub async fn close(self) {
        self.handle.close().await;
        let _ = self.reader.await;
    }

    /// Waits for the read loop to finish on its own.
    pub async fn join(self) {
        let _ = self.reader.await;
    }
}

pub async fn connect(
    server_url: &str,
    register: RegisterPayload,
    events: mpsc::Sender<TransportEvent>,
    options: ConnectOptions,
) -> Result<AgentTransport, TransportError> {
    let target = ServerTarget::parse(server_url)?;

    emit(&events, TransportEvent::State(ConnectionState::Resolving)).await;
    let tcp = tokio::time::timeout(
        options.connect_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| TransportError::Timeout(server_url.to_string()))??;
    tcp.set_nodelay(true)?;

    emit(
        &events,
        TransportEvent::State(ConnectionState::TransportHandshake),
    )
    .await;
    let mut stream: BoxedStream = if target.secure {
        Box::new(tls_connect(tcp, &target.host).await?)
    } else {
        Box::new(tcp)
    };

    emit(&events, TransportEvent::State(ConnectionState::ProtocolUpgrade)).await;
    let leftover = tokio::time::timeout(
        options.connect_timeout,
        handshake::perform(&mut stream, &target),
    )
    .await
    .map_err(|_| TransportError::Timeout(server_url.to_string()))??;
    info!(event = "upgrade_ok", host = %target.host, port = target.port, secure = target.secure);

    let (reader, writer) = tokio::io::split(stream);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = TransportHandle {
        writer: Arc::new(Mutex::new(Some(writer))),
        shutdown: Arc::new(shutdown_tx),
    };
    handle.send(&Envelope::Register(register)).await?;
    debug!(event = "register_sent");

    let mut decoder = FrameDecoder::new(options.max_payload);
    decoder.push(&leftover);
    let read_loop = ReadLoop {
        decoder,
        handle: handle.clone(),
        events,
        screen_lock_probe: options.screen_lock_probe,
        heartbeat: None,
        rejection: None,
    };
    let reader = tokio::spawn(read_loop.run(reader, shutdown_rx));
    Ok(AgentTransport { handle, reader })
}

async fn tls_connect(
    tcp: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TransportError> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|err| TransportError::Tls(format!("loading native roots: {err}")))?;
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(TransportError::Tls("no usable root certificates".to_string()));
    }
    debug!(event = "tls_roots", added = added, ignored = ignored);

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| TransportError::Tls(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|err| TransportError::Tls(format!("{host}: {err}")))?;
    let stream = TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await?;
    Ok(stream)
}

async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    let _ = events.send(event).await;
}

struct ReadLoop {
    decoder: FrameDecoder,
    handle: TransportHandle,
    events: mpsc::Sender<TransportEvent>,
    screen_lock_probe: fn() -> bool,
    heartbeat: Option<JoinHandle<()>>,
    rejection: Option<(String, String)>,
}

impl ReadLoop {
    async fn run(mut self, reader: ReadHalf<BoxedStream>, shutdown: watch::Receiver<bool>) {
        let reason = self.pump(reader, shutdown).await;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
            let _ = heartbeat.await;
        }
        self.handle.release().await;
        info!(event = "transport_disconnected", reason = ?reason);
        emit(&self.events, TransportEvent::State(ConnectionState::Disconnected)).await;
        emit(&self.events, TransportEvent::Disconnected(reason)).await;
    }

    async fn pump(
        &mut self,
        mut reader: ReadHalf<BoxedStream>,
        mut shutdown: watch::Receiver<bool>,
    ) -> DisconnectReason {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            loop {
                match self.decoder.next_frame() {
                    Ok(Some(frame)) => {
                        if let Some(reason) = self.on_frame(frame).await {
                            return reason;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(event = "frame_error", error = %err);
                        return DisconnectReason::Error(err.to_string());
                    }
                }
            }
            if *shutdown.borrow() {
                return DisconnectReason::Local;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return DisconnectReason::Local;
                    }
                }
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => {
                        return match self.rejection.take() {
                            Some((code, message)) => DisconnectReason::Rejected { code, message },
                            None => DisconnectReason::Eof,
                        };
                    }
                    Ok(read) => self.decoder.push(&chunk[..read]),
                    Err(err) => return DisconnectReason::Error(err.to_string()),
                },
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Option<DisconnectReason> {
        match frame.opcode {
            Opcode::Close => {
                let (code, reason) = match parse_close_payload(&frame.payload) {
                    Some((code, reason)) => (Some(code), reason),
                    None => (None, String::new()),
                };
                let _ = self
                    .handle
                    .write_frame(
                        Opcode::Close,
                        &close_payload(code.unwrap_or(CLOSE_NORMAL), ""),
                    )
                    .await;
                Some(match self.rejection.take() {
                    Some((code, message)) => DisconnectReason::Rejected { code, message },
                    None => DisconnectReason::Closed { code, reason },
                })
            }
            Opcode::Text => {
                let text = match frame.into_text() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = "message_invalid", error = %err);
                        return None;
                    }
                };
                match Envelope::from_text(&text) {
                    Ok(envelope) => self.on_envelope(envelope).await,
                    Err(err) => warn!(event = "message_invalid", error = %err),
                }
                None
            }
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Registered(payload) => {
                let interval = payload.config.heartbeat_interval();
                info!(
                    event = "registered",
                    agent_id = %payload.agent_id,
                    license_status = %payload.license_status,
                    heartbeat_ms = interval.as_millis() as u64
                );
                emit(&self.events, TransportEvent::State(ConnectionState::Registered)).await;
                emit(
                    &self.events,
                    TransportEvent::Registered {
                        agent_id: payload.agent_id,
                        license_status: payload.license_status,
                        heartbeat_interval: interval,
                    },
                )
                .await;
                if let Some(previous) = self.heartbeat.take() {
                    previous.abort();
                }
                self.heartbeat = Some(start_heartbeat(
                    self.handle.clone(),
                    interval,
                    self.screen_lock_probe,
                ));
                emit(&self.events, TransportEvent::State(ConnectionState::Heartbeating)).await;
            }
            Envelope::HeartbeatAck(payload) => {
                emit(&self.events, TransportEvent::LicenseStatus(payload.license_status)).await;
            }
            Envelope::Request(payload) => {
                debug!(event = "request_received", request_id = %payload.id, method = %payload.method);
                emit(
                    &self.events,
                    TransportEvent::Request {
                        id: payload.id,
                        method: payload.method,
                        params: payload.params,
                    },
                )
                .await;
            }
            Envelope::Ping(_) => {
                if let Err(err) = self.handle.send(&Envelope::pong()).await {
                    warn!(event = "pong_error", error = %err);
                }
            }
            Envelope::Error(payload) => {
                warn!(
                    event = "relay_error",
                    request_id = ?payload.id,
                    code = %payload.error.code,
                    message = %payload.error.message
                );
                if payload.id.is_none() {
                    self.rejection = Some((payload.error.code, payload.error.message));
                }
            }
            other => debug!(event = "envelope_ignored", kind = other.kind()),
        }
    }
}

fn start_heartbeat(handle: TransportHandle, interval: Duration, probe: fn() -> bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let locked = tokio::task::spawn_blocking(probe).await.unwrap_or(false);
            if let Err(err) = handle
                .send(&Envelope::Heartbeat(HeartbeatPayload::now(locked)))
                .await
            {
                debug!(event = "heartbeat_stopped", error = %err);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::accept_key;
    use acp_core::frame::CLOSE_POLICY_VIOLATION;
    use acp_core::{RegisteredPayload, SessionConfig};
    use serde_json::json;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    struct FakeRelay {
        stream: TcpStream,
        decoder: FrameDecoder,
    }

    impl FakeRelay {
        async fn accept(listener: &TcpListener, trailing: Option<Envelope>) -> Self {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut chunk = [0u8; 512];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = stream.read(&mut chunk).await.expect("read");
                assert!(read > 0, "client hung up during upgrade");
                request.extend_from_slice(&chunk[..read]);
            }
            let text = String::from_utf8(request).expect("utf8");
            let key = text
                .lines()
                .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
                .expect("key")
                .trim()
                .to_string();
            let mut response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                accept_key(&key)
            )
            .into_bytes();
            if let Some(envelope) = trailing {
                let text = envelope.to_text().expect("encode");
                response.extend(encode(Opcode::Text, text.as_bytes(), Role::Server));
            }
            stream.write_all(&response).await.expect("write");
            Self {
                stream,
                decoder: FrameDecoder::default(),
            }
        }

        async fn next_frame(&mut self) -> Frame {
            let mut chunk = [0u8; 4096];
            loop {
                if let Some(frame) = self.decoder.next_frame().expect("frame") {
                    assert!(frame.masked, "client frames must be masked");
                    return frame;
                }
                let read = self.stream.read(&mut chunk).await.expect("read");
                assert!(read > 0, "client hung up");
                self.decoder.push(&chunk[..read]);
            }
        }

        /// Next envelope that is not a heartbeat.
        async fn next_envelope(&mut self) -> Envelope {
            loop {
                let frame = self.next_frame().await;
                assert_eq!(frame.opcode, Opcode::Text);
                let envelope = Envelope::from_text(&frame.into_text().expect("utf8")).expect("json");
                if !matches!(envelope, Envelope::Heartbeat(_)) {
                    return envelope;
                }
            }
        }

        async fn send(&mut self, envelope: &Envelope) {
            let text = envelope.to_text().expect("encode");
            let frame = encode(Opcode::Text, text.as_bytes(), Role::Server);
            self.stream.write_all(&frame).await.expect("write");
        }

        async fn close(&mut self, code: u16, reason: &str) {
            let frame = encode(Opcode::Close, &close_payload(code, reason), Role::Server);
            self.stream.write_all(&frame).await.expect("write");
        }
    }

    fn options() -> ConnectOptions {
        ConnectOptions {
            screen_lock_probe: || false,
            ..ConnectOptions::default()
        }
    }

    fn registered(interval_ms: u64) -> Envelope {
        Envelope::Registered(RegisteredPayload {
            agent_id: "agent-1".to_string(),
            license_status: "active".to_string(),
            config: SessionConfig {
                heartbeat_interval: Some(interval_ms),
            },
        })
    }

    fn register_payload() -> RegisterPayload {
        RegisterPayload {
            machine_id: "m-1".to_string(),
            machine_name: "lab-pc".to_string(),
            token: Some("agt_test".to_string()),
            ..RegisterPayload::default()
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        loop {
            let event = tokio::time::timeout(WAIT, rx.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if !matches!(event, TransportEvent::State(_)) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn register_heartbeat_request_and_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}/ws", listener.local_addr().expect("addr"));
        let (tx, mut rx) = mpsc::channel(32);

        let server = tokio::spawn(async move {
            // `registered` rides in the same segment as the 101 response.
            let mut relay = FakeRelay::accept(&listener, Some(registered(50))).await;
            let Envelope::Register(register) = relay.next_envelope().await else {
                panic!("expected register first");
            };
            assert_eq!(register.credential(), Some("agt_test"));

            let heartbeat = relay.next_frame().await;
            let heartbeat = Envelope::from_text(&heartbeat.into_text().expect("utf8")).expect("json");
            assert!(matches!(heartbeat, Envelope::Heartbeat(_)));

            relay
                .send(&Envelope::request("req-1", "system_info", json!({})))
                .await;
            let reply = relay.next_envelope().await;
            assert_eq!(reply, Envelope::response("req-1", json!({"ok": true})));

            relay.close(CLOSE_NORMAL, "bye").await;
            while relay.next_frame().await.opcode != Opcode::Close {}
        });

        let transport = connect(&url, register_payload(), tx, options())
            .await
            .expect("connect");
        let handle = transport.handle();

        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Registered {
                agent_id: "agent-1".to_string(),
                license_status: "active".to_string(),
                heartbeat_interval: Duration::from_millis(50),
            }
        );
        let TransportEvent::Request { id, method, .. } = next_event(&mut rx).await else {
            panic!("expected request");
        };
        assert_eq!(method, "system_info");
        handle
            .send_response(&id, json!({"ok": true}))
            .await
            .expect("respond");

        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Disconnected(DisconnectReason::Closed {
                code: Some(CLOSE_NORMAL),
                reason: "bye".to_string()
            })
        );
        server.await.expect("server");
        transport.join().await;
        assert!(handle.is_closed().await);
        assert!(matches!(
            handle.send_response("late", json!(null)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn rejection_is_reported_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}/ws", listener.local_addr().expect("addr"));
        let (tx, mut rx) = mpsc::channel(32);

        let server = tokio::spawn(async move {
            let mut relay = FakeRelay::accept(&listener, None).await;
            assert!(matches!(relay.next_envelope().await, Envelope::Register(_)));
            relay
                .send(&Envelope::error(
                    None,
                    "registration_rejected",
                    "malformed credential",
                ))
                .await;
            relay
                .close(CLOSE_POLICY_VIOLATION, "registration rejected")
                .await;
        });

        let transport = connect(&url, register_payload(), tx, options())
            .await
            .expect("connect");
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Disconnected(DisconnectReason::Rejected {
                code: "registration_rejected".to_string(),
                message: "malformed credential".to_string()
            })
        );
        server.await.expect("server");
        transport.join().await;
    }

    #[tokio::test]
    async fn local_close_sends_normal_closure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}/ws", listener.local_addr().expect("addr"));
        let (tx, mut rx) = mpsc::channel(32);

        let server = tokio::spawn(async move {
            let mut relay = FakeRelay::accept(&listener, Some(registered(60_000))).await;
            assert!(matches!(relay.next_envelope().await, Envelope::Register(_)));
            let frame = relay.next_frame().await;
            assert_eq!(frame.opcode, Opcode::Close);
            assert_eq!(
                parse_close_payload(&frame.payload).map(|(code, _)| code),
                Some(CLOSE_NORMAL)
            );
        });

        let transport = connect(&url, register_payload(), tx, options())
            .await
            .expect("connect");
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Registered { .. }
        ));
        transport.close().await;
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Disconnected(DisconnectReason::Local)
        );
        server.await.expect("server");
    }

    #[tokio::test]
    async fn refused_upgrade_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}/ws", listener.local_addr().expect("addr"));
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut chunk = [0u8; 1024];
            let _ = stream.read(&mut chunk).await;
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await
                .expect("write");
        });

        let (tx, _rx) = mpsc::channel(32);
        let result = connect(&url, register_payload(), tx, options()).await;
        assert!(matches!(
            result,
            Err(TransportError::Handshake(HandshakeError::Status(404)))
        ));
        server.await.expect("server");
    }
}
