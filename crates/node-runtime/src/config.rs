//! Node-local configuration.
//!
//! Everything consensus-critical lives in [`GenesisConfig`]; this file
//! adds the operator-facing knobs (ports, directories, keys, peers) and
//! the JSON loader.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared_types::GenesisConfig;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory for the database and keys.
    pub data_dir: String,
    /// TCP listen port for the capability.
    pub listen_port: u16,
    /// Bootstrap peers, `host:port`.
    pub boot_nodes: Vec<String>,
    /// Node wallet secret (hex, 32 bytes). Generated when absent.
    pub node_secret: Option<String>,
    /// VRF secret (hex, 32 bytes). Generated when absent.
    pub vrf_secret: Option<String>,
    /// BLS secret (hex, 32 bytes). Generated when absent.
    pub bls_secret: Option<String>,
    pub is_light_node: bool,
    /// Periods of history a light node retains.
    pub light_node_history: u64,
    /// Worker threads of the packet threadpool.
    pub packet_workers: usize,
    /// Periods served per PBFT sync window.
    pub network_sync_level_size: u64,
    /// Network identifier for the handshake.
    pub network_id: u64,
    /// The consensus-critical genesis document.
    pub genesis: GenesisConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            listen_port: 10002,
            boot_nodes: vec![],
            node_secret: None,
            vrf_secret: None,
            bls_secret: None,
            is_light_node: false,
            light_node_history: 1000,
            packet_workers: 10,
            network_sync_level_size: 10,
            network_id: 1,
            genesis: GenesisConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config {}", path.as_ref().display()))?;
        serde_json::from_str(&raw).context("parsing config json")
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), raw)
            .with_context(|| format!("writing config {}", path.as_ref().display()))
    }

    /// Decode one of the hex secrets, if present.
    pub fn secret_bytes(value: &Option<String>) -> Result<Option<[u8; 32]>> {
        let Some(raw) = value else {
            return Ok(None);
        };
        let bytes = alloy_primitives::hex::decode(raw.trim_start_matches("0x"))
            .context("secret is not valid hex")?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("secret must be exactly 32 bytes"))?;
        Ok(Some(array))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = NodeConfig::default();
        config.listen_port = 10777;
        config.boot_nodes.push("127.0.0.1:10002".to_string());
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.listen_port, 10777);
        assert_eq!(loaded.boot_nodes.len(), 1);
        assert_eq!(
            loaded.genesis.genesis_hash(),
            config.genesis.genesis_hash()
        );
    }

    #[test]
    fn test_secret_parsing() {
        assert!(NodeConfig::secret_bytes(&None).unwrap().is_none());
        let secret = Some(format!("0x{}", "ab".repeat(32)));
        assert_eq!(
            NodeConfig::secret_bytes(&secret).unwrap(),
            Some([0xAB; 32])
        );
        assert!(NodeConfig::secret_bytes(&Some("zz".into())).is_err());
        assert!(NodeConfig::secret_bytes(&Some("abcd".into())).is_err());
    }
}
