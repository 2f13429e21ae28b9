//! Loading and persisting the TOML configuration document.
//!
//! The on-disk location follows platform convention: the XDG config
//! directory on Linux, the executable's directory elsewhere. A missing file
//! is created with defaults on first load. Unknown top-level keys are
//! reported as soft warnings rather than errors, so configs written by newer
//! versions keep loading.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::model::Config;

/// Top-level keys the current model understands.
const KNOWN_KEYS: &[&str] = &[
    "http_rules",
    "ws_enabled",
    "ws_rules",
    "stream",
    "access",
    "limits",
    "compression",
    "show_realtime_logs",
    "realtime_logs_only_errors",
];

/// Resolve the default config file path for this platform.
pub fn default_config_path() -> Result<PathBuf> {
    // A config.toml in the working directory wins during development.
    #[cfg(debug_assertions)]
    {
        let cwd_cfg = PathBuf::from("config.toml");
        if cwd_cfg.exists() {
            return Ok(cwd_cfg);
        }
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .context("cannot determine config directory (XDG_CONFIG_HOME/HOME unset)")?;
        return Ok(base.join("portico").join("config.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let exe = std::env::current_exe().context("cannot determine executable path")?;
        let dir = exe
            .parent()
            .context("cannot determine executable directory")?;
        Ok(dir.join("config.toml"))
    }
}

/// Load a config document from `path`, creating it with defaults when
/// missing. Returns the raw (unvalidated) config plus any unknown-key
/// warnings found in the document.
pub fn load(path: &Path) -> Result<(Config, Vec<String>)> {
    ensure_exists(path)?;

    let content = fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;

    let warnings = unknown_key_warnings(&content);
    for w in &warnings {
        warn!(warning = %w, "config contains unrecognized key");
    }

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("cannot parse config file {}", path.display()))?;

    Ok((config, warnings))
}

/// Persist `config` to `path`, creating parent directories as needed.
pub fn save(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create config directory {}", parent.display()))?;
    }

    let content = toml::to_string_pretty(config).context("cannot serialize config")?;
    fs::write(path, content)
        .with_context(|| format!("cannot write config file {}", path.display()))?;
    Ok(())
}

fn ensure_exists(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    save(path, &Config::default())
}

/// Scan the document's top-level keys against the known set.
fn unknown_key_warnings(content: &str) -> Vec<String> {
    let Ok(value) = content.parse::<toml::Value>() else {
        // A parse failure is reported with full context by `load`.
        return Vec::new();
    };

    let Some(table) = value.as_table() else {
        return Vec::new();
    };

    table
        .keys()
        .filter(|k| !KNOWN_KEYS.contains(&k.as_str()))
        .map(|k| format!("unknown top-level key `{k}`"))
        .collect()
}
