use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    /// Agent endpoint port.
    pub port: u16,
    pub client_port: u16,
    pub service_port: u16,
    pub log_level: String,
    pub mcp_servers: Vec<McpServerConfig>,
    /// Example agent/service definitions for launcher tooling. The hub core
    /// only reads the port triple and the MCP server list.
    pub agents: HashMap<String, serde_json::Value>,
    pub services: HashMap<String, serde_json::Value>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            client_port: 3001,
            service_port: 3002,
            log_level: "info".to_string(),
            mcp_servers: vec![],
            agents: HashMap::new(),
            services: HashMap::new(),
        }
    }
}

impl HubConfig {
    /// Load config from a TOML file, falling back to defaults for missing
    /// fields. After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: HubConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if the file doesn't exist, return defaults with
    /// env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("APIARY_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("APIARY_AGENT_PORT") {
            if let Ok(n) = v.parse() {
                self.port = n;
            }
        }
        if let Ok(v) = std::env::var("APIARY_CLIENT_PORT") {
            if let Ok(n) = v.parse() {
                self.client_port = n;
            }
        }
        if let Ok(v) = std::env::var("APIARY_SERVICE_PORT") {
            if let Ok(n) = v.parse() {
                self.service_port = n;
            }
        }
        if let Ok(v) = std::env::var("APIARY_LOG_LEVEL") {
            self.log_level = v;
        }
    }
}

// ============================================================================
// MCP server entries
// ============================================================================

/// One supervised MCP tool server. `server_type` selects the launch
/// convention (`node <path>` / `python <path>`) unless `command` is given
/// explicitly.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: Option<String>,
    pub path: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.client_port, 3001);
        assert_eq!(cfg.service_port, 3002);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.mcp_servers.is_empty());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
port = 4000
"#;
        let cfg: HubConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.port, 4000);
        // Defaults for unspecified fields
        assert_eq!(cfg.client_port, 3001);
        assert_eq!(cfg.host, "127.0.0.1");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
host = "0.0.0.0"
port = 3000
client_port = 3001
service_port = 3002
log_level = "debug"

[[mcp_servers]]
name = "fs"
type = "node"
path = "/opt/tools/fs.js"

[[mcp_servers]]
name = "calc"
command = "calc-server"
args = ["--stdio"]

[agents.echo]
script = "agents/echo.js"
"#;
        let cfg: HubConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.mcp_servers.len(), 2);
        assert_eq!(cfg.mcp_servers[0].name, "fs");
        assert_eq!(cfg.mcp_servers[0].server_type.as_deref(), Some("node"));
        assert_eq!(cfg.mcp_servers[1].command.as_deref(), Some("calc-server"));
        assert_eq!(cfg.mcp_servers[1].args, vec!["--stdio"]);
        assert!(cfg.agents.contains_key("echo"));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("APIARY_AGENT_PORT", "5000");
        std::env::set_var("APIARY_LOG_LEVEL", "trace");

        let mut cfg = HubConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.log_level, "trace");

        std::env::remove_var("APIARY_AGENT_PORT");
        std::env::remove_var("APIARY_LOG_LEVEL");
    }
}
