use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// User configuration from `~/.config/kiln/config.toml`.
///
/// Every field is optional; command-line flags and `KILN_HOME` take
/// precedence over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KilnConfig {
    /// Cache and work directory root.
    #[serde(default)]
    pub home: Option<PathBuf>,
    /// Recipe registry directory (`<name>/<version>.toml`).
    #[serde(default)]
    pub registry: Option<PathBuf>,
    #[serde(default)]
    pub jobs: Option<usize>,
    /// Default profile for `build` and `check`.
    #[serde(default)]
    pub profile: Option<PathBuf>,
}

impl KilnConfig {
    /// Load the default config file. A missing file yields the defaults.
    pub fn load_default() -> Result<Self, CoreError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| CoreError::Config(format!("invalid config {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// `$KILN_HOME`, then the configured home, then `~/.kiln`.
    pub fn resolve_home(&self) -> PathBuf {
        if let Some(home) = std::env::var_os("KILN_HOME").filter(|h| !h.is_empty()) {
            return PathBuf::from(home);
        }
        if let Some(home) = &self.home {
            return home.clone();
        }
        std::env::var_os("HOME")
            .map_or_else(|| PathBuf::from(".kiln"), |h| PathBuf::from(h).join(".kiln"))
    }
}

fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(base.join("kiln").join("config.toml"))
}
