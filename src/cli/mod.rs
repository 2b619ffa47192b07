//! Command-line interface.

mod common;
mod device;
mod serve;
mod usage;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use freetier::config::Config;

#[derive(Parser, Debug)]
#[command(name = "freetier", version, about = "Daily free-tier quota service")]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Config file (default: ~/.freetier/config.json)
    #[arg(long, global = true, env = "FREETIER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API server
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show whether an identity may use a feature now
    Check(IdentityArgs),
    /// Record one use of a feature
    Use(IdentityArgs),
    /// Show per-day usage history
    Usage {
        #[command(flatten)]
        who: IdentityArgs,
        /// Number of usage days to show, today included
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Print this installation's device id, creating it if needed
    DeviceId,
}

/// Identity selection shared by the usage commands.
#[derive(Args, Debug, Clone)]
pub struct IdentityArgs {
    /// Authenticated user id
    #[arg(long)]
    pub user: Option<String>,
    /// Device id (default: this installation's)
    #[arg(long, conflicts_with = "user")]
    pub device: Option<String>,
    /// Metered feature: solve, quiz or transcribe
    #[arg(long, default_value = "solve")]
    pub feature: String,
}

impl Command {
    /// The server logs request traces; one-shot commands stay quiet.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Command::Serve { .. } => "info",
            _ => "warn",
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = common::load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Serve { bind, port } => serve::cmd_serve(config, bind, port).await,
        Command::Check(who) => usage::cmd_check(&config, &who).await,
        Command::Use(who) => usage::cmd_use(&config, &who).await,
        Command::Usage { who, days } => usage::cmd_usage(&config, &who, days).await,
        Command::DeviceId => device::cmd_device_id(&config),
    }
}
