use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rotor_core::OutputFormat;

#[derive(Parser)]
#[command(name = "rotor")]
#[command(about = "Credential and identity rotation engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Config file; skips the user/project lookup
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Project root (defaults to CWD)
    #[arg(long, global = true)]
    pub cd: Option<PathBuf>,

    /// State directory (defaults to the XDG state dir)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Also write logs to rotor-{timestamp}.log in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },

    /// Inspect and repair persisted coordinator state
    State {
        #[command(subcommand)]
        cmd: StateCommands,
    },

    /// Inspect the credential pool
    Keys {
        #[command(subcommand)]
        cmd: KeysCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write a commented default config to {project}/.rotor/config.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show the effective configuration
    Show,
    /// Validate the effective configuration
    Validate,
}

#[derive(Subcommand)]
pub enum StateCommands {
    /// Show coordinator, identity and key pool state
    Show {
        /// Process id (defaults to coordinator.process_id)
        #[arg(long)]
        process_id: Option<String>,
    },
    /// Clear a rotation-in-progress marker left by a crashed process
    Unlock {
        #[arg(long)]
        process_id: Option<String>,
    },
    /// List recorded identity bindings (newest last)
    Bindings {
        /// Only show the last N entries
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
pub enum KeysCommands {
    /// Show per-key eligibility and metrics
    Status,
}
