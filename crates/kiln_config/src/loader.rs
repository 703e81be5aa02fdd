//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::{KilnConfig, MemoryConfig, MIN_PAGE_SIZE};
use std::path::Path;

/// Name of the configuration file within a project directory.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Loads and validates `<project_dir>/kiln.toml`.
pub fn load_config(project_dir: &Path) -> Result<KilnConfig, ConfigError> {
    let content = std::fs::read_to_string(project_dir.join(CONFIG_FILE))?;
    load_config_from_str(&content)
}

/// Like [`load_config`], but falls back to the built-in defaults when the
/// project has no `kiln.toml`.
pub fn load_config_or_default(project_dir: &Path) -> Result<KilnConfig, ConfigError> {
    match std::fs::read_to_string(project_dir.join(CONFIG_FILE)) {
        Ok(content) => load_config_from_str(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KilnConfig::default()),
        Err(e) => Err(e.into()),
    }
}

/// Parses and validates a `kiln.toml` configuration from a string.
pub fn load_config_from_str(content: &str) -> Result<KilnConfig, ConfigError> {
    let config: KilnConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &KilnConfig) -> Result<(), ConfigError> {
    validate_memory(&config.memory)?;
    for lib in &config.cache.runtime {
        if lib.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "cache.runtime entry has an empty name".to_string(),
            ));
        }
        if lib.path.is_none() && lib.digest_file.is_none() {
            return Err(ConfigError::ValidationError(format!(
                "cache.runtime '{}' needs either `path` or `digest_file`",
                lib.name
            )));
        }
    }
    Ok(())
}

fn validate_memory(mem: &MemoryConfig) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

    if mem.slot_count == 0 {
        return invalid("memory.slot_count must be non-zero".to_string());
    }
    if mem.base_address == 0 || mem.base_address % MIN_PAGE_SIZE != 0 {
        return invalid(format!(
            "memory.base_address {:#x} must be a non-zero multiple of {MIN_PAGE_SIZE:#x}",
            mem.base_address
        ));
    }
    for (name, size) in [("code_size", mem.code_size), ("data_size", mem.data_size)] {
        if size == 0 || size as u64 % MIN_PAGE_SIZE != 0 {
            return invalid(format!(
                "memory.{name} {size} must be a non-zero multiple of {MIN_PAGE_SIZE}"
            ));
        }
    }
    if mem.got_size >= mem.code_size {
        return invalid(format!(
            "memory.got_size {} must be smaller than memory.code_size {}",
            mem.got_size, mem.code_size
        ));
    }
    let span = (mem.slot_size() as u64).checked_mul(mem.slot_count as u64);
    let end = span.and_then(|s| s.checked_add(mem.base_address));
    if end.map_or(true, |end| end > usize::MAX as u64) {
        return invalid("memory slots extend past the end of the address space".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::FloatPrecision;
    use std::path::PathBuf;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.memory, MemoryConfig::default());
        assert!(config.cache.enabled);
        assert!(config.cache.runtime.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[memory]
base_address = 0x5000_0000_0000
slot_count = 4
code_size = 65536
data_size = 32768
got_size = 512

[cache]
dir = "/var/cache/kiln"
enabled = true
force_recompile = true
float_precision = "imprecise"

[[cache.runtime]]
name = "libkiln_rt.so"
path = "/usr/lib/libkiln_rt.so"

[[cache.runtime]]
name = "libkiln_core.so"
digest_file = "/usr/lib/libkiln_core.so.sha1"
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.memory.base_address, 0x5000_0000_0000);
        assert_eq!(config.memory.slot_count, 4);
        assert_eq!(config.memory.slot_size(), 98304);
        assert_eq!(config.memory.got_size, 512);
        assert_eq!(config.cache.dir, PathBuf::from("/var/cache/kiln"));
        assert!(config.cache.force_recompile);
        assert_eq!(config.cache.float_precision, Some(FloatPrecision::Imprecise));
        assert_eq!(config.cache.runtime.len(), 2);
        assert_eq!(
            config.cache.runtime[1].digest_file.as_deref(),
            Some(std::path::Path::new("/usr/lib/libkiln_core.so.sha1"))
        );
    }

    #[test]
    fn zero_slot_count_errors() {
        let err = load_config_from_str("[memory]\nslot_count = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn unaligned_base_errors() {
        let err = load_config_from_str("[memory]\nbase_address = 0x1234\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn unaligned_code_size_errors() {
        let err = load_config_from_str("[memory]\ncode_size = 5000\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn oversized_got_errors() {
        let toml = "[memory]\ncode_size = 4096\ngot_size = 4096\n";
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn runtime_without_source_errors() {
        let toml = "[[cache.runtime]]\nname = \"libkiln_rt.so\"\n";
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn invalid_toml_errors() {
        let err = load_config_from_str("this is not valid toml {{{}}}").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn unknown_precision_errors() {
        let err = load_config_from_str("[cache]\nfloat_precision = \"double\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn io_error_from_nonexistent_dir() {
        let err = load_config(Path::new("/nonexistent/dir")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(dir.path()).unwrap();
        assert_eq!(config.memory, MemoryConfig::default());
    }

    #[test]
    fn present_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[memory]\nslot_count = 2\n").unwrap();
        let config = load_config_or_default(dir.path()).unwrap();
        assert_eq!(config.memory.slot_count, 2);
    }
}
