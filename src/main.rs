// taskspine/src/main.rs
// Executor daemon entry point

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskspine::{
    EventBus, ExecutionGateway, ExecutorConfig, ExecutorSupervisor, TaskIntegration, TaskStore,
};

/// Task execution spine for an autonomous Minecraft agent
#[derive(Parser, Debug)]
#[command(name = "taskspine", version, about)]
struct Cli {
    /// Remote action endpoint base URL (overrides BOT_ENDPOINT_URL)
    #[arg(long)]
    endpoint: Option<String>,

    /// Poll interval in milliseconds (overrides EXECUTOR_POLL_MS)
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = ExecutorConfig::from_env();
    if let Some(endpoint) = cli.endpoint {
        config.bot_endpoint_url = endpoint;
    }
    if let Some(poll_ms) = cli.poll_ms {
        config.poll_ms = poll_ms;
    }

    if cli.show_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    info!(
        mode = config.mode.as_str(),
        poll_ms = config.poll_ms,
        endpoint = %config.bot_endpoint_url,
        "starting task execution spine"
    );

    let store = Arc::new(TaskStore::new(config.history_limit, config.strict_finalize));
    let (events, mut event_rx) = EventBus::new();
    let integration = Arc::new(TaskIntegration::new(
        Arc::clone(&store),
        config.clone(),
        events.clone(),
    ));
    let gateway = Arc::new(ExecutionGateway::new(config.clone()));
    let supervisor = Arc::new(ExecutorSupervisor::new(
        config,
        Arc::clone(&integration),
        Arc::clone(&gateway),
    ));

    // Drain lifecycle events into the log
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => info!(event = %line, "lifecycle event"),
                Err(err) => warn!(error = %err, "unserializable lifecycle event"),
            }
        }
    });

    supervisor.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    supervisor.emergency_stop();

    Ok(())
}
