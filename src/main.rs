//! Shell Bridge Server
//!
//! Exposes PTY-backed interactive shells over WebSocket, plus a one-shot
//! command path that runs a command to completion and reports its output.

mod bridge;
mod command;
mod config;
mod pty;
mod server;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use command::CommandRunner;
use config::{ServiceConfig, StepCatalog};
use server::WebSocketServer;

/// Shell Bridge Server
///
/// WebSocket bridge for interactive shells and one-shot commands
#[derive(Parser, Debug)]
#[command(name = "shell-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to ./shell-bridge.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Serve interactive shells over WebSocket (default)
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a command once and print the result as JSON
    Exec {
        /// Step whose variables are substituted into the command
        #[arg(long)]
        step: Option<String>,

        /// Extra variable, may be repeated
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Command to run
        command: String,
    },
}

/// Parse a `KEY=VALUE` pair
fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let config = ServiceConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Initialize logging; stdout is reserved for `exec` output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.verbose {
            "debug"
        } else {
            config.logging.level.as_str()
        })
    });

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command.unwrap_or(Command::Serve {
        port: None,
        bind: None,
    }) {
        Command::Serve { port, bind } => serve(config, port, bind).await,
        Command::Exec {
            step,
            vars,
            command,
        } => exec(config, step, vars, &command).await,
    }
}

async fn serve(
    mut config: ServiceConfig,
    port: Option<u16>,
    bind: Option<String>,
) -> anyhow::Result<ExitCode> {
    info!("Shell Bridge v{}", env!("CARGO_PKG_VERSION"));

    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if config.server.bind != "127.0.0.1" && config.server.bind != "localhost" {
        warn!(
            "Listening on {}; shells are reachable from other hosts",
            config.server.bind
        );
    }
    info!(
        "{} steps configured, {} blocked command patterns",
        config.steps.len(),
        config.policy.command_policy().patterns().len()
    );

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(ExitCode::SUCCESS)
}

async fn exec(
    config: ServiceConfig,
    step: Option<String>,
    vars: Vec<(String, String)>,
    command: &str,
) -> anyhow::Result<ExitCode> {
    let mut variables = HashMap::new();
    if let Some(step_id) = step.as_deref() {
        match StepCatalog::new(config.steps.iter().cloned()).resolve(step_id) {
            Some(context) => variables = context.variables,
            None => warn!("Unknown step {}; continuing without variables", step_id),
        }
    }
    variables.extend(vars);

    let result = CommandRunner::from_config(&config)
        .run(command, &variables)
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
