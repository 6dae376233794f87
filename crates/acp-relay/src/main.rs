use acp_relay::{
    config::{addr_port, load_config},
    logging::init_logging,
    serve, RelayState,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(config.debug, &config.log_dir, addr_port(&config.addr));
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "relay_error", error = %err);
            return;
        }
    };

    info!(
        event = "relay_config",
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        heartbeat_interval_ms = config.heartbeat_interval.as_millis() as u64,
        stale_seconds = config.stale_seconds
    );
    let state = Arc::new(RelayState::new(config));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = serve(listener, state, shutdown).await {
        error!(event = "relay_error", error = %err);
    }
}
