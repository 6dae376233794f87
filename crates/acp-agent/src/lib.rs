//! Agent side of the control protocol: opens the WebSocket session to the
//! relay, registers the machine, heartbeats and executes relayed commands.

pub mod config;
pub mod handler;
pub mod handshake;
pub mod logging;
pub mod machine;
pub mod supervisor;
pub mod transport;

pub use handler::{BuiltinHandler, CommandFailure, CommandHandler};
pub use machine::MachineInfo;
pub use transport::{
    connect, AgentTransport, ConnectOptions, ConnectionState, DisconnectReason, TransportError,
    TransportEvent, TransportHandle,
};
