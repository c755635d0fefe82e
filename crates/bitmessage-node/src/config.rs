//! Configuration types for bitmessage-node.
//! Parsed from ~/.bitmessage/config.toml.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use bitmessage_governor::GovernorTargets;
use serde::{Deserialize, Serialize};

use crate::client::ClientSettings;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub governor: GovernorSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_20")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_20")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_inactivity")]
    pub inactivity_timeout_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            dial_timeout_secs: 20,
            handshake_timeout_secs: 20,
            inactivity_timeout_secs: default_inactivity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorSection {
    #[serde(default = "default_8")]
    pub max_outbound: usize,
    #[serde(default = "default_100")]
    pub max_inbound: usize,
    #[serde(default = "default_30")]
    pub min_retry_interval_secs: u64,
    #[serde(default = "default_1")]
    pub housekeeping_interval_secs: u64,
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            max_outbound: 8,
            max_inbound: 100,
            min_retry_interval_secs: 30,
            housekeeping_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default = "default_1")]
    pub services: u64,
    #[serde(default = "default_1")]
    pub stream: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            services: bitmessage_protocol::SERVICES_PROVIDED,
            stream: bitmessage_protocol::STREAM,
            user_agent: default_user_agent(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", bitmessage_protocol::DEFAULT_PORT)
}
fn default_inactivity() -> u64 {
    bitmessage_protocol::MAINNET.inactivity_timeout_secs
}
fn default_protocol_version() -> u32 {
    bitmessage_protocol::PROTOCOL_VERSION
}
fn default_user_agent() -> String {
    bitmessage_protocol::user_agent()
}
fn default_1() -> u64 {
    1
}
fn default_8() -> usize {
    8
}
fn default_20() -> u64 {
    20
}
fn default_30() -> u64 {
    30
}
fn default_100() -> usize {
    100
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: NodeConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn governor_targets(&self) -> GovernorTargets {
        GovernorTargets {
            max_outbound: self.governor.max_outbound,
            max_inbound: self.governor.max_inbound,
            min_retry_interval_secs: self.governor.min_retry_interval_secs,
            housekeeping_interval_secs: self.governor.housekeeping_interval_secs,
        }
    }

    /// Validate and convert into runtime settings.
    pub fn client_settings(&self) -> anyhow::Result<ClientSettings> {
        let listen_addr: SocketAddr = self
            .network
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen_addr {:?}", self.network.listen_addr))?;
        let targets = self.governor_targets();
        targets.validate()?;
        if self.protocol.stream == 0 {
            anyhow::bail!("stream must be non-zero");
        }

        Ok(ClientSettings {
            listen_addr,
            targets,
            dial_timeout: Duration::from_secs(self.network.dial_timeout_secs),
            handshake_timeout: Duration::from_secs(self.network.handshake_timeout_secs),
            inactivity_timeout: Duration::from_secs(self.network.inactivity_timeout_secs),
            protocol_version: self.protocol.protocol_version,
            services: self.protocol.services,
            stream: self.protocol.stream,
            user_agent: self.protocol.user_agent.clone(),
            ..ClientSettings::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.network.listen_addr, "0.0.0.0:8444");
        assert_eq!(cfg.governor.max_outbound, 8);
        assert_eq!(cfg.governor.max_inbound, 100);
        assert_eq!(cfg.governor.min_retry_interval_secs, 30);
        assert_eq!(cfg.protocol.protocol_version, 2);
        assert_eq!(cfg.protocol.stream, 1);
        assert_eq!(cfg.governor_targets(), GovernorTargets::default());
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
[network]
listen_addr = "127.0.0.1:9444"

[governor]
max_outbound = 4
"#;
        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.network.listen_addr, "127.0.0.1:9444");
        assert_eq!(cfg.network.handshake_timeout_secs, 20);
        assert_eq!(cfg.network.inactivity_timeout_secs, 600);
        assert_eq!(cfg.governor.max_outbound, 4);
        assert_eq!(cfg.governor.max_inbound, 100);
        assert_eq!(cfg.governor.housekeeping_interval_secs, 1);
        assert_eq!(cfg.protocol, ProtocolSection::default());
    }

    #[test]
    fn test_empty_file_is_default() {
        let cfg: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, NodeConfig::default());
    }

    #[test]
    fn test_serialise_default_round_trips() {
        let cfg = NodeConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        assert!(toml_str.contains("[network]"));
        assert!(toml_str.contains("[governor]"));
        assert!(toml_str.contains("user_agent"));
        let back: NodeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_client_settings() {
        let mut cfg = NodeConfig::default();
        cfg.network.listen_addr = "127.0.0.1:0".into();
        cfg.network.dial_timeout_secs = 5;
        cfg.protocol.user_agent = "/custom:1.0/".into();
        let s = cfg.client_settings().unwrap();
        assert_eq!(s.listen_addr, "127.0.0.1:0".parse::<SocketAddr>().unwrap());
        assert_eq!(s.dial_timeout, Duration::from_secs(5));
        assert_eq!(s.inactivity_timeout, Duration::from_secs(600));
        assert_eq!(s.user_agent, "/custom:1.0/");
        assert_eq!(s.targets.max_outbound, 8);
    }

    #[test]
    fn test_client_settings_rejects_bad_values() {
        let mut cfg = NodeConfig::default();
        cfg.network.listen_addr = "not an address".into();
        assert!(cfg.client_settings().is_err());

        let mut cfg = NodeConfig::default();
        cfg.governor.max_outbound = 0;
        assert!(cfg.client_settings().is_err());

        let mut cfg = NodeConfig::default();
        cfg.protocol.stream = 0;
        assert!(cfg.client_settings().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[governor]\nmin_retry_interval_secs = 45\n").unwrap();
        let cfg = NodeConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg.governor.min_retry_interval_secs, 45);

        std::fs::write(&path, "[governor\n").unwrap();
        assert!(NodeConfig::load_or_default(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = NodeConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, NodeConfig::default());
    }
}
