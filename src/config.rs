//! Configuration file support.
//!
//! Loads an optional `mimble.toml` from the data directory. CLI flags
//! override config file values; the `MIMBLE_DATA_DIR` environment variable
//! overrides the data directory itself. Missing file or sections fall back
//! to defaults.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Default P2P listen port.
pub const DEFAULT_P2P_PORT: u16 = 13414;
/// Default JSON-RPC listen port.
pub const DEFAULT_RPC_PORT: u16 = 13413;
/// Default cap on connected peers.
pub const DEFAULT_MAX_PEERS: usize = 32;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MimbleConfig {
    pub node: NodeConfig,
    pub p2p: P2pConfig,
    pub rpc: RpcConfig,
    pub wallet: WalletConfig,
}

/// Node-wide settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: String,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: "./mimble-data".into(),
            log_level: "info".into(),
        }
    }
}

/// P2P section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub host: String,
    pub port: u16,
    pub seeds: Vec<String>,
    pub max_peers: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        P2pConfig {
            host: "0.0.0.0".into(),
            port: DEFAULT_P2P_PORT,
            seeds: vec![],
            max_peers: DEFAULT_MAX_PEERS,
        }
    }
}

/// Foreign JSON-RPC section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            host: "127.0.0.1".into(),
            port: DEFAULT_RPC_PORT,
        }
    }
}

/// Wallet section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub node_url: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig {
            node_url: format!("http://127.0.0.1:{DEFAULT_RPC_PORT}"),
        }
    }
}

impl MimbleConfig {
    /// Load `mimble.toml` from the given directory, falling back to
    /// defaults if absent or unparsable.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("mimble.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "failed to parse {}: {e}, using defaults",
                        config_path.display()
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// The effective data directory after the environment override.
    pub fn data_dir(&self) -> PathBuf {
        match std::env::var("MIMBLE_DATA_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(&self.node.data_dir),
        }
    }

    /// Parse seed peers into socket addresses, dropping malformed entries.
    pub fn seed_addrs(&self) -> Vec<SocketAddr> {
        self.p2p
            .seeds
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}
