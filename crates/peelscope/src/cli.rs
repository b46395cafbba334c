use std::path::PathBuf;

use bitcoin::{OutPoint, Txid};
use clap::{Parser, Subcommand, ValueEnum};

/// Trace Bitcoin peeling chains across a local node, an
/// Electrum server, and a public block explorer.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Bitcoin Core RPC URL.
    #[arg(long, default_value = "http://127.0.0.1:8332", env = "PEELSCOPE_NODE_URL")]
    pub node_url: String,

    /// RPC username.
    #[arg(long, env = "PEELSCOPE_NODE_USER")]
    pub node_user: Option<String>,

    /// RPC password.
    #[arg(long, env = "PEELSCOPE_NODE_PASS")]
    pub node_pass: Option<String>,

    /// Path to the node's `.cookie` file, used instead of user/pass.
    #[arg(long, env = "PEELSCOPE_NODE_COOKIE")]
    pub node_cookie: Option<PathBuf>,

    /// Client-side cap on RPC calls per second.
    #[arg(long, env = "PEELSCOPE_NODE_RPS")]
    pub node_requests_per_second: Option<u32>,

    /// Run without a local node. Every lookup then needs the public API.
    #[arg(long, env = "PEELSCOPE_NO_LOCAL_NODE")]
    pub no_local_node: bool,

    /// Electrum server host. Spend lookups go through it while the local
    /// node is authoritative. Its TLS certificate is not verified.
    #[arg(long, env = "PEELSCOPE_ELECTRUM_HOST")]
    pub electrum_host: Option<String>,

    #[arg(long, default_value = "50002", env = "PEELSCOPE_ELECTRUM_PORT")]
    pub electrum_port: u16,

    /// Per-operation Electrum timeout in seconds.
    #[arg(long, default_value = "20", env = "PEELSCOPE_ELECTRUM_TIMEOUT")]
    pub electrum_timeout_secs: u64,

    /// Esplora-compatible public API root.
    #[arg(
        long,
        default_value = "https://mempool.space/api",
        env = "PEELSCOPE_PUBLIC_API_URL"
    )]
    pub public_api_url: String,

    /// Minimum milliseconds between public API calls.
    #[arg(long, default_value = "500", env = "PEELSCOPE_PUBLIC_API_INTERVAL_MS")]
    pub public_api_interval_ms: u64,

    /// Never contact the public API.
    #[arg(long, env = "PEELSCOPE_NO_PUBLIC_API")]
    pub no_public_api: bool,

    /// JSONL file the graph store is loaded from and saved to.
    /// If omitted, the store is in-memory only.
    #[arg(long, env = "PEELSCOPE_STORE")]
    pub store: Option<PathBuf>,

    /// What to do when a trusted source fails and the public API is the
    /// only way forward.
    #[arg(long, value_enum, default_value = "ask", env = "PEELSCOPE_FALLBACK")]
    pub fallback: FallbackMode,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FallbackMode {
    /// Prompt on the terminal.
    Ask,
    Allow,
    Deny,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve transactions and write them to the graph store.
    Store {
        #[arg(required = true)]
        txids: Vec<Txid>,
    },

    /// Follow the largest output forward, storing each transaction.
    TracePath {
        txid: Txid,

        /// Stop after this many stored transactions.
        #[arg(long)]
        max_steps: Option<usize>,
    },

    /// Remove a transaction from the graph store.
    Delete {
        txid: Txid,

        /// Also remove the outpoints it spends and creates.
        #[arg(long)]
        with_outpoints: bool,
    },

    /// Remove one outpoint (`txid:vout`) from the graph store.
    DeleteOutpoint { outpoint: OutPoint },

    /// Trace the peeling chain starting at a transaction.
    Peel {
        txid: Txid,

        #[arg(long, default_value = "100")]
        max_hops: usize,
    },

    /// Consolidation metrics for a transaction's inputs.
    FanIn { txid: Txid },

    /// Distribution metrics for a transaction's outputs.
    FanOut { txid: Txid },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Store { .. } => "store",
            Self::TracePath { .. } => "trace-path",
            Self::Delete { .. } => "delete",
            Self::DeleteOutpoint { .. } => "delete-outpoint",
            Self::Peel { .. } => "peel",
            Self::FanIn { .. } => "fan-in",
            Self::FanOut { .. } => "fan-out",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peel_with_defaults() {
        let cli = Cli::try_parse_from([
            "peelscope",
            "peel",
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        ])
        .expect("valid args");
        assert_eq!(cli.fallback, FallbackMode::Ask);
        assert!(cli.electrum_host.is_none());
        assert!(matches!(cli.command, Command::Peel { max_hops: 100, .. }));
    }

    #[test]
    fn parses_outpoint_and_flags() {
        let cli = Cli::try_parse_from([
            "peelscope",
            "--fallback",
            "deny",
            "--electrum-host",
            "electrum.local",
            "delete-outpoint",
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b:0",
        ])
        .expect("valid args");
        assert_eq!(cli.fallback, FallbackMode::Deny);
        assert_eq!(cli.electrum_host.as_deref(), Some("electrum.local"));
        let Command::DeleteOutpoint { outpoint } = cli.command else {
            panic!("expected delete-outpoint");
        };
        assert_eq!(outpoint.vout, 0);
    }

    #[test]
    fn rejects_malformed_txid() {
        assert!(Cli::try_parse_from(["peelscope", "fan-out", "nothex"]).is_err());
    }
}
