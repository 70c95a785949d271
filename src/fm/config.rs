use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bind address handed to the node. Part of the launch contract: downstream tooling expects the
/// node at `http://0.0.0.0:<port>`.
pub const NODE_HOST: &str = "0.0.0.0";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterConfig {
    pub node: NodeConfig,
    pub web_console: WebConsoleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// argv prefix used to launch the node; `--port`, `--fork-url`, ... are appended.
    pub command: Vec<String>,
    pub port: u16,
    /// Wait after SIGTERM before escalating to SIGKILL.
    pub stop_grace_period_ms: u64,
    /// Wait after reclaiming the port so the OS releases the socket.
    pub port_settle_ms: u64,
    pub log_capacity: usize,
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConsoleConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            port: default_node_port(),
            stop_grace_period_ms: default_stop_grace_period_ms(),
            port_settle_ms: default_port_settle_ms(),
            log_capacity: default_log_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for WebConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_web_bind(),
            port: default_web_port(),
        }
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    #[serde(default)]
    node: Option<NodeConfigFile>,
    #[serde(default)]
    web_console: Option<WebConsoleConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeConfigFile {
    #[serde(default = "default_command")]
    command: Vec<String>,
    #[serde(default = "default_node_port")]
    port: u16,
    #[serde(default = "default_stop_grace_period_ms")]
    stop_grace_period_ms: u64,
    #[serde(default = "default_port_settle_ms")]
    port_settle_ms: u64,
    #[serde(default = "default_log_capacity")]
    log_capacity: usize,
    #[serde(default = "default_event_capacity")]
    event_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WebConsoleConfigFile {
    #[serde(default = "default_web_enabled")]
    enabled: bool,
    #[serde(default = "default_web_bind")]
    bind: String,
    #[serde(default = "default_web_port")]
    port: u16,
}

fn default_command() -> Vec<String> {
    vec!["anvil".to_string()]
}
fn default_node_port() -> u16 {
    8545
}
fn default_stop_grace_period_ms() -> u64 {
    5000
}
fn default_port_settle_ms() -> u64 {
    1000
}
fn default_log_capacity() -> usize {
    2000
}
fn default_event_capacity() -> usize {
    500
}
fn default_web_enabled() -> bool {
    true
}
fn default_web_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_web_port() -> u16 {
    5000
}

pub fn parse_master_config(raw: &str) -> anyhow::Result<MasterConfig> {
    let file_cfg: MasterConfigFile = serde_yaml::from_str(raw)?;
    let mut cfg = MasterConfig::default();

    if let Some(n) = file_cfg.node {
        cfg.node = NodeConfig {
            command: n.command,
            port: n.port,
            stop_grace_period_ms: n.stop_grace_period_ms,
            port_settle_ms: n.port_settle_ms,
            log_capacity: n.log_capacity,
            event_capacity: n.event_capacity,
        };
    }
    if let Some(wc) = file_cfg.web_console {
        cfg.web_console = WebConsoleConfig {
            enabled: wc.enabled,
            bind: wc.bind,
            port: wc.port,
        };
    }

    validate(&cfg)?;
    Ok(cfg)
}

pub fn load_master_config(config_path: &Path) -> anyhow::Result<MasterConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    parse_master_config(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))
}

pub fn validate(cfg: &MasterConfig) -> anyhow::Result<()> {
    anyhow::ensure!(!cfg.node.command.is_empty(), "node.command must not be empty");
    anyhow::ensure!(
        !cfg.node.command[0].trim().is_empty(),
        "node.command[0] (program) must not be empty"
    );
    anyhow::ensure!(cfg.node.port != 0, "node.port must be non-zero");
    anyhow::ensure!(cfg.node.log_capacity > 0, "node.log_capacity must be > 0");
    anyhow::ensure!(cfg.node.event_capacity > 0, "node.event_capacity must be > 0");
    anyhow::ensure!(
        cfg.node.stop_grace_period_ms > 0,
        "node.stop_grace_period_ms must be > 0"
    );
    if cfg.web_console.enabled {
        let _addr: std::net::SocketAddr = format!("{}:{}", cfg.web_console.bind, cfg.web_console.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("web_console bind/port invalid: {e}"))?;
        anyhow::ensure!(
            cfg.web_console.port != cfg.node.port,
            "web_console.port must differ from node.port ({}): the node port is reclaimed on every start",
            cfg.node.port
        );
    }
    Ok(())
}
