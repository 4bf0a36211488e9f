use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rotor_config::{RotorConfig, validate_config};
use rotor_core::OutputFormat;
use tracing::info;

use crate::cli::Cli;

/// Paths every command resolves the same way.
#[derive(Debug, Clone)]
pub(crate) struct CommandContext {
    pub project_root: PathBuf,
    pub config_path: Option<PathBuf>,
    pub state_dir: PathBuf,
}

impl CommandContext {
    pub(crate) fn resolve(cli: &Cli) -> Result<Self> {
        let project_root = match &cli.cd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to determine current directory")?,
        };
        Ok(Self {
            project_root,
            config_path: cli.config.clone(),
            state_dir: cli
                .state_dir
                .clone()
                .unwrap_or_else(rotor_config::paths::state_dir),
        })
    }

    pub(crate) fn load_config(&self) -> Result<RotorConfig> {
        RotorConfig::load(self.config_path.as_deref(), &self.project_root)
    }

    fn init_target(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| RotorConfig::project_config_path(&self.project_root))
    }
}

pub(crate) fn handle_config_init(ctx: &CommandContext, force: bool) -> Result<()> {
    let path = write_template(&ctx.init_target(), force)?;
    eprintln!("Wrote default configuration to: {}", path.display());
    Ok(())
}

fn write_template(path: &Path, force: bool) -> Result<PathBuf> {
    if path.exists() && !force {
        bail!(
            "{} already exists. Pass --force to overwrite.",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, RotorConfig::default_template())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Config template written");
    Ok(path.to_path_buf())
}

pub(crate) fn handle_config_show(ctx: &CommandContext, format: OutputFormat) -> Result<()> {
    let config = ctx.load_config()?;
    print!("{}", render_config(&config, format)?);
    Ok(())
}

fn render_config(config: &RotorConfig, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => toml::to_string_pretty(config)?,
    })
}

pub(crate) fn handle_config_validate(ctx: &CommandContext) -> Result<()> {
    let config = ctx.load_config()?;
    validate_config(&config)?;
    eprintln!("Configuration is valid");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(root: &Path) -> CommandContext {
        CommandContext {
            project_root: root.to_path_buf(),
            config_path: None,
            state_dir: root.join("state"),
        }
    }

    #[test]
    fn test_init_writes_template_that_loads_and_validates() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());

        let path = write_template(&ctx.init_target(), false).unwrap();
        assert_eq!(path, tmp.path().join(".rotor").join("config.toml"));

        let config = RotorConfig::load_from_path(&path).unwrap();
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_init_refuses_to_overwrite_without_force() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("custom.toml");
        std::fs::write(&path, "# mine\n").unwrap();

        let err = write_template(&path, false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine\n");

        write_template(&path, true).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("[coordinator]"));
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let explicit = tmp.path().join("explicit.toml");
        std::fs::write(&explicit, "[coordinator]\nprocess_id = \"edge-7\"\n").unwrap();

        let ctx = CommandContext {
            config_path: Some(explicit),
            ..context(tmp.path())
        };
        assert_eq!(ctx.load_config().unwrap().coordinator.process_id, "edge-7");
    }

    #[test]
    fn test_render_config_formats() {
        let config = RotorConfig::default();
        let json: serde_json::Value =
            serde_json::from_str(&render_config(&config, OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["key_pool"]["name"], "primary");

        let text = render_config(&config, OutputFormat::Text).unwrap();
        let back: RotorConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.coordinator.process_id, config.coordinator.process_id);
    }
}
