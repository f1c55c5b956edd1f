use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::{
    agent_api::HttpAgentClient,
    config::ExecutorConfig,
    executor::{Executor, Message},
    executor_api::HttpEndpoint,
    probes::standard::{StandardCheckerFactory, StandardHealthCheckerFactory},
};

mod agent_api;
mod config;
mod data_model;
mod executor;
mod executor_api;
mod exit_status;
mod probes;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory containing helper binaries used by task probes.
    #[arg(long = "launcher_dir", value_name = "DIR", default_value = "/usr/libexec")]
    launcher_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let cli = Cli::parse();

    let config = match ExecutorConfig::from_env(cli.launcher_dir) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(error = %err, "invalid executor configuration");
            std::process::exit(1);
        }
    };

    info!(
        executor_id = %config.executor_id,
        framework_id = %config.framework_id,
        agent = %config.agent_api_url,
        "starting task-group executor"
    );

    let agent = Arc::new(HttpAgentClient::new(
        config.agent_api_url.clone(),
        config.agent_authority.clone(),
        config.auth_header.clone(),
    ));

    let (upcall_tx, mut upcall_rx) = mpsc::unbounded_channel();
    let endpoint = Arc::new(HttpEndpoint::spawn(
        format!("{}/executor", config.agent_api_url),
        config.agent_authority.clone(),
        config.auth_header.clone(),
        upcall_tx,
    ));

    let executor = Executor::new(
        config,
        agent,
        endpoint,
        Arc::new(StandardCheckerFactory),
        Arc::new(StandardHealthCheckerFactory),
    );

    // Endpoint upcalls feed the actor mailbox like every other event.
    let mailbox = executor.mailbox();
    tokio::spawn(async move {
        while let Some(event) = upcall_rx.recv().await {
            if mailbox.send(Message::Endpoint(event)).is_err() {
                break;
            }
        }
    });

    executor.run().await;
}
