use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

mod cli;
mod config_cmds;
mod keys_cmds;
mod logging;
mod state_cmds;

use cli::{Cli, Commands, ConfigCommands, KeysCommands, StateCommands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Keep the guard alive until exit so buffered file logs are flushed.
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    let ctx = config_cmds::CommandContext::resolve(&cli)?;
    let format = cli.format;

    match cli.command {
        Commands::Config { cmd } => match cmd {
            ConfigCommands::Init { force } => config_cmds::handle_config_init(&ctx, force)?,
            ConfigCommands::Show => config_cmds::handle_config_show(&ctx, format)?,
            ConfigCommands::Validate => config_cmds::handle_config_validate(&ctx)?,
        },
        Commands::State { cmd } => match cmd {
            StateCommands::Show { process_id } => {
                state_cmds::handle_state_show(&ctx, process_id, format).await?
            }
            StateCommands::Unlock { process_id } => {
                state_cmds::handle_state_unlock(&ctx, process_id).await?
            }
            StateCommands::Bindings { limit } => {
                state_cmds::handle_state_bindings(&ctx, limit, format)?
            }
        },
        Commands::Keys { cmd } => match cmd {
            KeysCommands::Status => keys_cmds::handle_keys_status(&ctx, format).await?,
        },
    }

    Ok(())
}

/// stderr always; a file layer too when `--log-dir` is given.
fn init_tracing(
    log_dir: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stderr = fmt::layer().with_writer(std::io::stderr);
    let file = log_dir.and_then(|dir| match logging::create_log_writer(dir) {
        Ok(pair) => Some(pair),
        Err(e) => {
            eprintln!("WARNING: file logging disabled: {e:#}");
            None
        }
    });
    let (file_layer, guard) = match file {
        Some((writer, guard)) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(stderr)
        .with(file_layer)
        .try_init()
        .ok();
    guard
}
