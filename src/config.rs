use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::filter;
use crate::types::{Result, WatchError};

/// Everything the watcher needs, assembled from the command line.
#[derive(Debug, Clone, Default)]
pub struct WatchConfig {
    /// Interfaces to watch; empty means all interfaces.
    pub interfaces: Vec<String>,
    /// Filter strings, e.g. "IsGlobalUnicast" or "!IsLoopback".
    pub filters: Vec<String>,
    /// Hook specs, e.g. "internal:echo" or "executable:/path/to/script".
    pub hooks: Vec<String>,
    /// Watch only IPv4 address changes. Mutually exclusive with `ipv6_only`.
    pub ipv4_only: bool,
    /// Watch only IPv6 address changes. Mutually exclusive with `ipv4_only`.
    pub ipv6_only: bool,
    /// Maximum attempts for a failing hook (>= 1).
    pub max_retries: u32,
    /// Optional KEY=VALUE file added to every executable hook's environment.
    pub env_file: Option<PathBuf>,
}

/// Configuration-time validation. Anything caught here is fatal before the
/// watch loop starts; the watcher never re-validates.
pub fn validate_config(config: &WatchConfig) -> Result<()> {
    if config.ipv4_only && config.ipv6_only {
        return Err(WatchError::Config(
            "cannot watch only IPv4 and only IPv6 at the same time".to_string(),
        ));
    }

    if config.max_retries == 0 {
        return Err(WatchError::Config(
            "max retries must be at least 1".to_string(),
        ));
    }

    filter::parse_filters(&config.filters)?;

    let mut seen = HashSet::new();
    for hook in &config.hooks {
        if !seen.insert(hook.as_str()) {
            return Err(WatchError::Config(format!("duplicate hook: {}", hook)));
        }
    }

    Ok(())
}

/// Loads a flat KEY=VALUE environment file for executable hooks. Blank lines
/// and lines starting with '#' are skipped.
pub fn load_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let contents = fs::read_to_string(path).map_err(|e| {
        WatchError::Config(format!("failed to read env file {:?}: {}", path, e))
    })?;

    let mut vars = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                vars.push((key.trim().to_string(), value.trim().to_string()));
            }
            _ => {
                return Err(WatchError::Config(format!(
                    "env file {:?} line {}: expected KEY=VALUE",
                    path,
                    lineno + 1
                )));
            }
        }
    }

    Ok(vars)
}
