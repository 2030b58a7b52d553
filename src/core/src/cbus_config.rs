use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value};

use cbus_protocol::TapConfig;

/// Optional file configuration, loaded from `~/.cbus/config.toml`.
///
/// Carries what should survive coordinator restarts: the default
/// backend server, servers to index on boot, and a default tap.
/// Everything here can be replaced at runtime by client actions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CbusConfig {
    #[serde(default)]
    pub backend: BackendSection,
    /// Tool servers indexed at startup.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub tap: Option<TapSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendSection {
    /// Default server for proxied calls and unqualified `list_tools`.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TapSection {
    pub server_url: String,
    pub tool_name: String,
    #[serde(default)]
    pub connected_string_arg: Option<String>,
    #[serde(default)]
    pub connected_array_arg: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl CbusConfig {
    pub fn config_path() -> Result<PathBuf, String> {
        let dirs = directories::BaseDirs::new().ok_or("no home directory")?;
        Ok(dirs.home_dir().join(".cbus").join("config.toml"))
    }

    /// Load the config file; a missing file yields the defaults.
    pub fn load() -> Result<Self, String> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| format!("read {}: {e}", path.display()))?;
        toml::from_str(&raw).map_err(|e| format!("parse {}: {e}", path.display()))
    }

    pub fn default_tap(&self) -> Option<TapConfig> {
        self.tap.as_ref().map(|tap| TapConfig {
            server_url: tap.server_url.clone(),
            tool_name: tap.tool_name.clone(),
            connected_string_arg: tap.connected_string_arg.clone(),
            connected_array_arg: tap.connected_array_arg.clone(),
            args: tap.args.clone(),
        })
    }
}
