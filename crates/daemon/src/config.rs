use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::inbound::InboundConfig;
use crate::lighthouse::Cidr;
use crate::tun::TunConfig;
use crate::window::DEFAULT_WINDOW;

/// Top-level configuration for the Veilmesh daemon.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub tun: TunSection,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub lighthouse: LighthouseConfig,
}

/// Daemon runtime settings.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// Virtual interface settings.
#[derive(Debug, Deserialize)]
pub struct TunSection {
    #[serde(default = "default_tun_name")]
    pub name: String,
    pub address: Option<Ipv4Addr>,
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for TunSection {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            address: None,
            netmask: default_netmask(),
            mtu: default_mtu(),
        }
    }
}

/// Inbound transport tuning.
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    /// Counters tracked by each session's replay window.
    #[serde(default = "default_replay_window")]
    pub replay_window: u64,
    /// Seconds before a peer may roam back to its previous address.
    #[serde(default = "default_roam_suppress")]
    pub roam_suppress_secs: u64,
    /// Inbound recv-errors ignored before a session counts as degraded.
    #[serde(default = "default_recv_error_threshold")]
    pub recv_error_threshold: u32,
    /// Seconds without authenticated traffic before a tunnel is flagged idle.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            replay_window: default_replay_window(),
            roam_suppress_secs: default_roam_suppress(),
            recv_error_threshold: default_recv_error_threshold(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Lighthouse role and roaming policy.
#[derive(Debug, Deserialize, Default)]
pub struct LighthouseConfig {
    /// Whether this node advertises peers to others.
    #[serde(default)]
    pub am_lighthouse: bool,
    /// CIDRs a peer may roam to. Empty admits every address.
    #[serde(default)]
    pub allow_roam: Vec<String>,
}

fn default_port() -> u16 {
    4242
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_tun_name() -> String {
    "veil0".to_string()
}
fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}
fn default_mtu() -> u16 {
    1300
}
fn default_replay_window() -> u64 {
    DEFAULT_WINDOW
}
fn default_roam_suppress() -> u64 {
    30
}
fn default_recv_error_threshold() -> u32 {
    4
}
fn default_idle_timeout() -> u64 {
    120
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return the default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/veilmesh/config.toml",
            "~/.veilmesh/config.toml",
            "./config.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }

    pub fn inbound(&self) -> InboundConfig {
        InboundConfig {
            roam_suppress: Duration::from_secs(self.transport.roam_suppress_secs),
            recv_error_threshold: self.transport.recv_error_threshold,
            am_lighthouse: self.lighthouse.am_lighthouse,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.idle_timeout_secs)
    }

    pub fn allow_roam_cidrs(&self) -> Result<Vec<Cidr>> {
        self.lighthouse
            .allow_roam
            .iter()
            .map(|s| s.parse().context(format!("invalid allow_roam entry {:?}", s)))
            .collect()
    }

    pub fn tun_config(&self) -> Option<TunConfig> {
        self.tun.address.map(|address| TunConfig {
            name: self.tun.name.clone(),
            address,
            netmask: self.tun.netmask,
            mtu: self.tun.mtu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.daemon.port, 4242);
        assert_eq!(config.transport.replay_window, DEFAULT_WINDOW);
        assert_eq!(config.inbound().roam_suppress, Duration::from_secs(30));
        assert!(!config.lighthouse.am_lighthouse);
        assert!(config.tun_config().is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            port = 4243

            [tun]
            address = "10.128.0.5"

            [transport]
            replay_window = 2048

            [lighthouse]
            am_lighthouse = true
            allow_roam = ["192.0.2.0/24", "10.0.0.0/8"]
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.port, 4243);
        assert_eq!(config.daemon.metrics_port, 9090);
        assert_eq!(config.transport.replay_window, 2048);
        assert_eq!(config.transport.recv_error_threshold, 4);
        assert!(config.inbound().am_lighthouse);
        assert_eq!(config.allow_roam_cidrs().unwrap().len(), 2);

        let tun = config.tun_config().unwrap();
        assert_eq!(tun.address, Ipv4Addr::new(10, 128, 0, 5));
        assert_eq!(tun.name, "veil0");
    }

    #[test]
    fn test_bad_allow_roam_entry_is_an_error() {
        let config: Config = toml::from_str(
            r#"
            [lighthouse]
            allow_roam = ["not-a-network/99"]
            "#,
        )
        .unwrap();

        assert!(config.allow_roam_cidrs().is_err());
    }
}
