use acp_agent::{
    config::{load_config, Args},
    logging::init_logging,
    supervisor::{self, Session},
    BuiltinHandler, ConnectOptions, MachineInfo,
};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(Args::parse()).context("loading agent config")?;
    let machine = MachineInfo::detect();
    let _log_guard = init_logging(&config.log_dir, &machine.machine_name, config.log_stdout);

    if config.save_config {
        config
            .agent
            .save(&config.config_path)
            .context("saving agent config")?;
        info!(event = "config_saved", path = %config.config_path.display());
    }

    if !config.agent.connect_on_startup {
        info!(event = "connect_disabled", path = %config.config_path.display());
        return Ok(());
    }

    info!(
        event = "agent_start",
        server_url = %config.agent.server_url,
        machine_id = %machine.machine_id,
        name = %machine.machine_name,
        os = %machine.os_type,
        arch = %machine.arch
    );

    let register = machine.register_payload(
        config.agent.token.clone(),
        config.agent.license_uuid.clone(),
        config.agent.customer_id.clone(),
    );
    let session = Session {
        server_url: config.agent.server_url.clone(),
        register,
        handler: Arc::new(BuiltinHandler::new(machine)),
        reconnect_delay: config.agent.reconnect_delay(),
        options: ConnectOptions::default(),
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    supervisor::run(session, shutdown).await;
    Ok(())
}
