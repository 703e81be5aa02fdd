//! Configuration lookup shared by subcommands.

use std::path::Path;

use kiln_config::{ConfigError, KilnConfig};

use crate::GlobalArgs;

/// Loads the configuration named by `--config`, or `kiln.toml` in the current
/// directory, or the built-in defaults when neither exists.
pub fn load(global: &GlobalArgs) -> Result<KilnConfig, ConfigError> {
    match &global.config {
        Some(path) => load_file(path),
        None => kiln_config::load_config_or_default(&std::env::current_dir()?),
    }
}

fn load_file(path: &Path) -> Result<KilnConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    kiln_config::load_config_from_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(config: Option<&Path>) -> GlobalArgs {
        GlobalArgs {
            quiet: true,
            color: false,
            config: config.map(Path::to_path_buf),
        }
    }

    #[test]
    fn explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[memory]\nslot_count = 3\n").unwrap();
        let config = load(&global(Some(&path))).unwrap();
        assert_eq!(config.memory.slot_count, 3);
    }

    #[test]
    fn missing_explicit_config_errors() {
        let err = load(&global(Some(Path::new("/nonexistent/kiln.toml")))).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
