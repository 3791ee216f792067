//! relayline - stdio to WebSocket relay.
//!
//! Reads newline-delimited envelopes on stdin, relays them to connected
//! executors, and writes what executors send back to stdout.
//!
//! ```bash
//! # Listen on the default port (4000)
//! relayline serve
//!
//! # Print the effective configuration
//! relayline config show
//! ```

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};

use relayline::config::{self, RelayConfig};
use relayline::{Relay, StdioSink};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.common.config {
        Some(path) => config::expand_path(path)?,
        None => config::default_config_file()?,
    };

    match cli.command {
        Command::Serve(cmd) => {
            let config = RelayConfig::load(Some(config_path.as_path()))?;
            init_logging(&cli.common, Some(&config.logging.level));
            debug!("config file: {}", config_path.display());
            serve(config, cmd)
        }
        Command::Config { command } => {
            init_logging(&cli.common, None);
            handle_config(&config_path, command)
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Relay correlated commands between stdio and WebSocket executors.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Relay stdin/stdout to WebSocket executors
    Serve(ServeCommand),
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Logs always go to stderr; stdout carries the upstream protocol.
fn init_logging(common: &CommonOpts, configured: Option<&str>) {
    let level = if common.quiet {
        LevelFilter::Error
    } else {
        effective_log_level(common, configured)
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .target(env_logger::Target::Stderr)
        .try_init()
        .ok();
}

/// Flags win over the configured level.
fn effective_log_level(common: &CommonOpts, configured: Option<&str>) -> LevelFilter {
    if common.trace {
        LevelFilter::Trace
    } else if common.debug {
        LevelFilter::Debug
    } else {
        match common.verbose {
            0 => configured
                .and_then(|level| level.parse().ok())
                .unwrap_or(LevelFilter::Info),
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

const STDIO_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn serve(mut config: RelayConfig, cmd: ServeCommand) -> Result<()> {
    if let Some(port) = cmd.port {
        config.server.port = port;
    }
    if let Some(host) = cmd.host {
        config.server.host = host;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let (sink, writer) = StdioSink::spawn();
    let relay = Relay::bind(addr.as_str(), Arc::new(sink))
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("Relay id {}", relay.id());

    let result = relay
        .run(tokio::io::stdin(), relayline::server::shutdown_signal())
        .await
        .context("relaying upstream");

    // The relay has dropped its sink; let the writer drain what is queued.
    if tokio::time::timeout(STDIO_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!("Timed out flushing stdout");
    }
    result
}

fn handle_config(path: &std::path::Path, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = RelayConfig::load(Some(path))?;
            print!("{}", config.to_toml(path)?);
        }
        ConfigCommand::Path => println!("{}", path.display()),
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "config file {} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            RelayConfig::write_default(path)?;
            info!("Wrote default config to {}", path.display());
        }
    }
    Ok(())
}
