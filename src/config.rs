//! Server configuration records.
//!
//! The manager treats this as an opaque list supplied at construction time;
//! the TOML document shape mirrors the `[[mcp_servers]]` tables used by the
//! host application's configuration file.

use crate::error::McpError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Transport kind: `stdio` or `http`/`streamable-http`. Defaults to
    /// streamable HTTP when absent.
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// When present, only the listed remote tool names are published.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn display_label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl McpConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, McpError> {
        toml::from_str(input).map_err(|err| McpError::Config(err.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, McpError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            McpError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }
}
