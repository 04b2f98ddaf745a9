use clap::Parser;

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration of a ledger node
#[derive(Debug, Clone, Parser)]
#[command(name = "pow-ledger", version, about = "Proof-of-work ledger node")]
pub struct NodeConfig {
    /// Address the HTTP API binds to
    #[arg(long, default_value = "127.0.0.1", env = "LEDGER_HOST")]
    pub host: String,

    /// Port the HTTP API listens on
    #[arg(short, long, default_value = "5000", env = "LEDGER_PORT")]
    pub port: u16,

    /// Directory of the sled database
    #[arg(long, default_value = "data/blockchain", env = "LEDGER_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Keep the chain in memory only
    #[arg(long, env = "LEDGER_IN_MEMORY")]
    pub in_memory: bool,

    /// Public key credited with mining rewards; a fresh wallet is generated when absent
    #[arg(long, env = "LEDGER_NODE_ADDRESS")]
    pub node_address: Option<String>,

    /// Peers registered at startup, as URLs or host:port
    #[arg(long, value_delimiter = ',', env = "LEDGER_PEERS")]
    pub peers: Vec<String>,

    /// Seconds to wait for a peer's chain
    #[arg(long, default_value = "5", env = "LEDGER_PEER_TIMEOUT_SECS")]
    pub peer_timeout_secs: u64,

    /// Resolve conflicts with peers every N seconds; disabled when unset
    #[arg(long, env = "LEDGER_RESOLVE_INTERVAL_SECS")]
    pub resolve_interval_secs: Option<u64>,
}

impl NodeConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn resolve_interval(&self) -> Option<Duration> {
        self.resolve_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
