//! Configuration file management for wtask.
//!
//! Provides a TOML-based config file at `~/.config/wtask/config.toml` and a
//! resolution chain: CLI flag > env var > task-file field > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub defaults: DefaultsSection,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct DefaultsSection {
    /// Program used for subtasks that do not specify one.
    #[serde(default)]
    pub program: String,
    /// Timeout applied to subtasks that do not specify one, e.g. "30m".
    #[serde(default)]
    pub timeout: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the wtask config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/wtask` or `~/.config/wtask`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("wtask");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("wtask")
}

/// Return the path to the wtask config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved defaults
// -----------------------------------------------------------------------

/// Fully resolved operator defaults, ready for use when applying overrides
/// to a loaded task file.
#[derive(Debug, Default)]
pub struct ResolvedDefaults {
    pub program: Option<String>,
    pub timeout: Option<String>,
}

impl ResolvedDefaults {
    /// Resolve defaults using the chain: CLI flag > env var > config file.
    ///
    /// - Program: `cli_program` > `WTASK_DEFAULT_PROGRAM` env > config file
    /// - Timeout: `cli_timeout` > `WTASK_DEFAULT_TIMEOUT` env > config file
    pub fn resolve(cli_program: Option<&str>, cli_timeout: Option<&str>) -> Self {
        let file_config = load_config().ok();

        let program = cli_program
            .map(str::to_string)
            .or_else(|| std::env::var("WTASK_DEFAULT_PROGRAM").ok())
            .or_else(|| {
                file_config
                    .as_ref()
                    .map(|c| c.defaults.program.clone())
                    .filter(|p| !p.is_empty())
            });

        let timeout = cli_timeout
            .map(str::to_string)
            .or_else(|| std::env::var("WTASK_DEFAULT_TIMEOUT").ok())
            .or_else(|| {
                file_config
                    .as_ref()
                    .map(|c| c.defaults.timeout.clone())
                    .filter(|t| !t.is_empty())
            });

        Self { program, timeout }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("wtask/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        unsafe { std::env::set_var("WTASK_DEFAULT_PROGRAM", "env-program") };

        let resolved = ResolvedDefaults::resolve(Some("cli-program"), None);
        assert_eq!(resolved.program.as_deref(), Some("cli-program"));

        unsafe { std::env::remove_var("WTASK_DEFAULT_PROGRAM") };
    }

    #[test]
    fn resolve_with_env_var_when_no_cli_flag() {
        let _lock = lock_env();
        unsafe { std::env::set_var("WTASK_DEFAULT_TIMEOUT", "1h") };

        let resolved = ResolvedDefaults::resolve(None, None);
        assert_eq!(resolved.timeout.as_deref(), Some("1h"));

        unsafe { std::env::remove_var("WTASK_DEFAULT_TIMEOUT") };
    }

    #[test]
    fn resolve_defaults_to_none_when_nothing_set() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("WTASK_DEFAULT_PROGRAM") };
        unsafe { std::env::remove_var("WTASK_DEFAULT_TIMEOUT") };
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        let tmp = tempfile::TempDir::new().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let resolved = ResolvedDefaults::resolve(None, None);
        assert!(resolved.program.is_none());
        assert!(resolved.timeout.is_none());

        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let original = ConfigFile {
            defaults: DefaultsSection {
                program: "claude".into(),
                timeout: "45m".into(),
            },
        };
        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.defaults.program, "claude");
        assert_eq!(loaded.defaults.timeout, "45m");
    }
}
