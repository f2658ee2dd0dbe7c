use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::Path;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use workspace_bridge::{build_router, AppState, BridgeConfig, BridgeOptions, PortMappingManager};

#[derive(Parser, Debug)]
#[command(name = "workspace-bridge", author, version)]
struct Cli {
    #[command(flatten)]
    options: BridgeOptions,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the websocket and HTTP endpoints (default)
    Serve,
    /// Inspect or change reverse-proxy port mappings
    #[command(subcommand)]
    Ports(PortsCommand),
}

#[derive(Subcommand, Debug)]
enum PortsCommand {
    /// Print the current mappings
    List,
    /// Print allow-listed external ports that are free
    Available,
    /// Map an external port to a workspace port
    Add {
        internal: u16,
        external: u16,
        /// Skip the proxy reload
        #[arg(long)]
        no_reload: bool,
    },
    /// Remove a mapping
    Remove {
        internal: u16,
        external: u16,
        #[arg(long)]
        no_reload: bool,
    },
    /// Install bridge routing on port 80 if nothing serves it
    Init {
        #[arg(long)]
        no_reload: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_dir = cli.options.log_dir.clone();
    let config = BridgeConfig::from(cli.options);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let _guard = init_tracing(log_dir.as_deref());
            serve(config).await
        }
        Command::Ports(command) => {
            init_cli_tracing();
            run_ports(config, command).await
        }
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    };

    if let Err(error) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "workspace-bridge: cannot use log dir {} ({error}), logging to stdout only",
            log_dir.display()
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "workspace-bridge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

/// Port commands print JSON on stdout, so logs go to stderr.
fn init_cli_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    tracing::info!("shutdown signal received");
}

async fn serve(config: BridgeConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("creating workspace root {}", config.root.display()))?;
    let addr = config.listen_addr()?;
    let app = build_router(AppState::new(&config));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        root = %config.root.display(),
        proxy_dir = %config.proxy.conf_dir.display(),
        "workspace-bridge listening on http://{}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn run_ports(config: BridgeConfig, command: PortsCommand) -> anyhow::Result<()> {
    let ports = PortMappingManager::new(config.proxy);
    match command {
        PortsCommand::List => print_json(&ports.list_current_mapping().await?),
        PortsCommand::Available => print_json(&ports.list_available_external_ports().await?),
        PortsCommand::Add {
            internal,
            external,
            no_reload,
        } => print_json(&ports.create(internal, external, !no_reload).await?),
        PortsCommand::Remove {
            internal,
            external,
            no_reload,
        } => {
            ports.delete(internal, external, !no_reload).await?;
            print_json(&serde_json::json!({ "internalPort": internal, "externalPort": external }))
        }
        PortsCommand::Init { no_reload } => {
            let written = ports.ensure_bridge_routing(!no_reload).await?;
            print_json(&serde_json::json!({ "written": written }))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
