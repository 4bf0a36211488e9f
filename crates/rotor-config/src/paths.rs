use std::path::{Path, PathBuf};

/// XDG app name used for config and state directories.
pub const APP_NAME: &str = "rotor";

/// Project-local config directory name (`{project}/.rotor`).
pub const PROJECT_DIR_NAME: &str = ".rotor";

const CONFIG_FILE_NAME: &str = "config.toml";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// User config directory (`~/.config/rotor`).
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// User-level config file (`~/.config/rotor/config.toml`).
pub fn user_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Project-level config file (`{project}/.rotor/config.toml`).
pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(PROJECT_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// State directory for durable records.
///
/// Prefers the XDG state dir, falls back to the local data dir where the
/// platform has no state dir (macOS), and finally to the temp dir when no
/// home directory can be determined (containers).
pub fn state_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| {
            dirs.state_dir()
                .unwrap_or_else(|| dirs.data_local_dir())
                .to_path_buf()
        })
        .unwrap_or_else(|| std::env::temp_dir().join("rotor-state"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_config_path_convention() {
        let path = project_config_path(Path::new("/work/repo"));
        assert_eq!(path, PathBuf::from("/work/repo/.rotor/config.toml"));
    }

    #[test]
    fn test_state_dir_is_absolute() {
        assert!(state_dir().is_absolute());
    }
}
