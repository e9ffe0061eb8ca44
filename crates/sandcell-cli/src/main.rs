//! Sandcell CLI - capability-gated JavaScript execution
//!
//! Usage:
//!   sandcell serve [--host 0.0.0.0] [--port 3000]   - Start the HTTP server
//!   sandcell run script.js -c fs -c uuid             - Execute a file once

mod server;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sandcell_core::{CompilerService, Config, ExecutionRequest};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sandcell")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Capability-gated JavaScript execution service", long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true, env = "SANDCELL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides server.port)
        #[arg(long, env = "PORT")]
        port: Option<u16>,

        /// Executions allowed at once (overrides server.max_concurrent)
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Execution deadline in milliseconds (overrides sandbox.timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Execute a script once and print the response
    Run {
        /// Script to execute, or `-` for stdin
        file: PathBuf,

        /// Capability to grant (repeatable)
        #[arg(short = 'c', long = "capability")]
        capabilities: Vec<String>,

        /// Execution deadline in milliseconds (overrides sandbox.timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Serve {
            host,
            port,
            max_concurrent,
            timeout_ms,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(max_concurrent) = max_concurrent {
                anyhow::ensure!(max_concurrent > 0, "--max-concurrent must be at least 1");
                config.server.max_concurrent = max_concurrent;
            }
            apply_timeout(&mut config, timeout_ms)?;

            let service = CompilerService::new(&config);
            server::serve(&config.server.host, config.server.port, service).await?;
        }

        Commands::Run {
            file,
            capabilities,
            timeout_ms,
        } => {
            apply_timeout(&mut config, timeout_ms)?;

            let source = read_source(&file)?;
            let request = ExecutionRequest::new(source).with_capabilities(capabilities);
            let reply = CompilerService::new(&config).execute(&request).await;

            println!("{}", serde_json::to_string_pretty(&reply.body)?);
            if !reply.is_success() {
                if let Some(kind) = reply.kind {
                    eprintln!("{kind}");
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn apply_timeout(config: &mut Config, timeout_ms: Option<u64>) -> anyhow::Result<()> {
    if let Some(timeout_ms) = timeout_ms {
        anyhow::ensure!(timeout_ms > 0, "--timeout-ms must be greater than 0");
        config.sandbox.timeout_ms = timeout_ms;
    }
    Ok(())
}

fn read_source(file: &Path) -> anyhow::Result<String> {
    if file == Path::new("-") {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read script from stdin")?;
        return Ok(source);
    }
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}
