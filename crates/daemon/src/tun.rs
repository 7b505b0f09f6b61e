//! Virtual network interface (TUN) seam.
//!
//! The inbound fast path ends in a single blocking write of a decrypted
//! inner packet. Everything else about the device (reads for the egress
//! path, routing, lifecycle) is outside the data plane.

use std::io::{self, Write};
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use log::info;

/// Write seam for the inbound fast path. Tests supply a buffer-backed
/// implementation.
pub trait Tun {
    /// Deliver one decrypted inner packet to the local stack.
    fn write_raw(&mut self, packet: &[u8]) -> io::Result<usize>;
}

/// TUN interface configuration.
#[derive(Debug, Clone)]
pub struct TunConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "veil0".to_string(),
            address: Ipv4Addr::new(10, 128, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: 1300,
        }
    }
}

/// Layer 3 TUN device.
pub struct TunDevice {
    device: tun2::Device,
    config: TunConfig,
}

impl TunDevice {
    /// Create and bring up a TUN interface.
    pub fn create(config: TunConfig) -> Result<Self> {
        info!(
            "creating TUN interface '{}' with IP {}/{}",
            config.name, config.address, config.netmask
        );

        let mut tun_config = tun2::Configuration::default();
        tun_config
            .tun_name(&config.name)
            .address(config.address)
            .netmask(config.netmask)
            .mtu(config.mtu)
            .up();

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|p| {
            p.ensure_root_privileges(true);
        });

        let device = tun2::create(&tun_config).context("failed to create TUN device")?;

        info!("TUN interface '{}' is up (mtu {})", config.name, config.mtu);
        Ok(Self { device, config })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

impl Tun for TunDevice {
    fn write_raw(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.device.write(packet)
    }
}

/// Either a real device or a sink, so the daemon can run without TUN
/// privileges for diagnostics.
pub enum Inside {
    Device(TunDevice),
    Discard,
}

impl Tun for Inside {
    fn write_raw(&mut self, packet: &[u8]) -> io::Result<usize> {
        match self {
            Inside::Device(device) => device.write_raw(packet),
            Inside::Discard => Ok(packet.len()),
        }
    }
}

/// Check whether this process can plausibly create TUN devices.
pub fn check_tun_permissions() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if std::fs::metadata("/dev/net/tun").is_err() {
            anyhow::bail!("TUN device not available. Is the tun module loaded?");
        }
        if unsafe { libc::geteuid() } != 0 {
            log::warn!("not running as root, TUN creation may fail without CAP_NET_ADMIN");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if unsafe { libc::geteuid() } != 0 {
            anyhow::bail!("root privileges required for TUN device on macOS");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tun_config_default() {
        let config = TunConfig::default();
        assert_eq!(config.name, "veil0");
        assert_eq!(config.address, Ipv4Addr::new(10, 128, 0, 1));
        assert_eq!(config.mtu, 1300);
    }

    #[test]
    fn test_discard_accepts_everything() {
        let mut inside = Inside::Discard;
        assert_eq!(inside.write_raw(&[0u8; 64]).unwrap(), 64);
    }
}
