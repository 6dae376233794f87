//! Wire-level building blocks shared by the relay and the agent: the binary
//! frame codec, the JSON envelopes carried inside text frames, and the
//! JSON-RPC shapes used by the relay façade. Also hosts the log sink both
//! binaries install.

pub mod envelope;
pub mod frame;
pub mod logging;
pub mod rpc;

pub use envelope::{
    Envelope, EnvelopeError, ErrorPayload, Fingerprint, HeartbeatAckPayload, HeartbeatPayload,
    PingPayload, RegisterPayload, RegisteredPayload, RequestPayload, ResponsePayload,
    SessionConfig, WireError, DEFAULT_HEARTBEAT_INTERVAL_MS,
};
pub use frame::{
    Decoded, Frame, FrameDecoder, FrameError, Opcode, Role, DEFAULT_MAX_PAYLOAD_BYTES,
};
pub use rpc::{ErrorCode, RpcError, RpcNotification, RpcRequest, RpcResponse};
