use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "forkmaster", version, about = "Supervisor for a forked anvil test node")]
pub struct Args {
    /// Path to config YAML (built-in defaults apply when omitted)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Override node.port from the config
    #[arg(long = "port")]
    pub port: Option<u16>,

    /// Start a node forking this upstream RPC URL as soon as the daemon is up
    #[arg(long = "fork-url")]
    pub fork_url: Option<String>,

    /// Chain id for the boot-time node (requires --fork-url)
    #[arg(long = "chain-id", requires = "fork_url")]
    pub chain_id: Option<u64>,
}
