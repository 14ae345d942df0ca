//! tcpchat - TCP chat relay
//!
//! `tcpchat server` runs the relay; `tcpchat client` is a line-based
//! terminal client.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tcpchat_net::{Config, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod terminal;

/// TCP chat relay.
#[derive(Parser, Debug)]
#[command(name = "tcpchat", version, about = "TCP chat relay")]
struct Cli {
    /// Config file (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Server {
        /// Address to listen on.
        #[arg(long)]
        bind: Option<String>,

        /// Greet each new connection with a welcome frame.
        #[arg(long)]
        greet: bool,

        /// Outbound frames queued per connection.
        #[arg(long)]
        queue: Option<usize>,
    },
    /// Connect to a server from the terminal.
    Client {
        /// Server address.
        #[arg(long)]
        server: Option<String>,

        /// Print received messages as JSON lines.
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Config::load_default().context("Failed to load default config"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Server { bind, greet, queue } => {
            init_logging("info");

            let mut server_config = config.server;
            if let Some(bind) = bind {
                server_config.bind = bind;
            }
            if let Some(queue) = queue {
                server_config.outbound_queue = queue;
            }
            server_config.greet_new_peers |= greet;

            tracing::info!(bind = %server_config.bind, "Starting chat server");
            let server = Server::start(server_config)
                .await
                .context("Error starting chat server")?;

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl-c")?;
            server.shutdown().await;
        }
        Command::Client { server, json } => {
            init_logging("warn");

            let mut client_config = config.client;
            if let Some(server) = server {
                client_config.server = server;
            }
            terminal::run(&client_config, json).await?;
        }
    }

    Ok(())
}
