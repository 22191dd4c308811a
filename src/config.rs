//! Node configuration: command-line arguments, the `config.yaml` file and MAC
//! address material.

use std::net::Ipv4Addr;
use std::path::Path;

use clap::Parser;
use rand::RngCore;
use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::frame::MacAddr;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "tapmesh", about = "Peer-to-peer layer-2 overlay over UDP")]
pub struct Args {
    /// IP address to assign to the TAP interface
    #[arg(long)]
    pub ip: Ipv4Addr,

    /// Network mask (advisory; the interface is configured /24)
    #[arg(long)]
    pub mask: String,

    /// MAC address for the TAP interface (generated when absent)
    #[arg(long)]
    pub mac: Option<String>,

    /// TAP interface name
    #[arg(long)]
    pub dev: String,

    /// IP to connect to directly (reserved, unused)
    #[arg(long)]
    pub direct: Option<String>,

    /// Infohash identifying the overlay
    #[arg(long, default_value = "none")]
    pub hash: String,
}

fn default_iptool() -> String {
    "ip".to_string()
}

/// Keys recognized in `config.yaml`. Unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    /// Path to the OS network-configuration helper.
    #[serde(default = "default_iptool")]
    pub iptool: String,
}

impl FileConfig {
    /// Load the configuration file. Absence or malformed YAML is a setup
    /// error and terminates startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

/// Immutable node configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Overlay IPv4 address assigned to the TAP interface.
    pub ip: Ipv4Addr,
    /// Requested netmask; advisory, the interface is configured /24.
    pub mask: String,
    /// MAC address of the TAP interface.
    pub mac: MacAddr,
    /// TAP device name.
    pub device: String,
    /// Path to the OS network-configuration helper.
    pub iptool: String,
    /// Infohash identifying the overlay.
    pub network_hash: String,
    /// UDP bind port; 0 lets the OS choose.
    pub port: u16,
    /// Reserved: direct peering target.
    pub direct: Option<String>,
}

impl NodeConfig {
    pub fn from_args(args: Args, file: FileConfig) -> Result<Self> {
        let mac = match &args.mac {
            Some(text) => text.parse::<MacAddr>()?,
            None => {
                let (text, mac) = generate_mac();
                info!("generated MAC {} for TAP device", text);
                mac
            }
        };
        Ok(NodeConfig {
            ip: args.ip,
            mask: args.mask,
            mac,
            device: args.dev,
            iptool: file.iptool,
            network_hash: args.hash,
            port: 0,
            direct: args.direct,
        })
    }
}

/// Six random bytes with the locally-administered bit set on the first.
fn randomize_mac_bytes() -> [u8; 6] {
    let mut buf = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut buf);
    buf[0] |= 0x02;
    buf
}

/// Generate a MAC for the TAP device. The printed form hard-codes the first
/// octet to `06` and uses the five random trailing bytes.
pub fn generate_mac() -> (String, MacAddr) {
    let buf = randomize_mac_bytes();
    let text = format!(
        "06:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        buf[1], buf[2], buf[3], buf[4], buf[5]
    );
    let mac = MacAddr::new([0x06, buf[1], buf[2], buf[3], buf[4], buf[5]]);
    (text, mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn randomized_bytes_carry_the_local_bit() {
        for _ in 0..32 {
            let buf = randomize_mac_bytes();
            assert_ne!(buf[0] & 0x02, 0);
        }
    }

    #[test]
    fn generated_mac_uses_the_fixed_prefix() {
        let (text, mac) = generate_mac();
        assert!(text.starts_with("06:"));
        assert_eq!(mac.octets()[0], 0x06);
        assert!(mac.is_local());
        assert_eq!(text.parse::<MacAddr>().unwrap(), mac);
    }

    #[test]
    fn file_config_reads_iptool_and_ignores_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "iptool: /sbin/ip").unwrap();
        writeln!(file, "something_else: 42").unwrap();
        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.iptool, "/sbin/ip");
    }

    #[test]
    fn file_config_defaults_iptool() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "unrelated: true").unwrap();
        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.iptool, "ip");
    }

    #[test]
    fn missing_config_file_is_a_setup_error() {
        let err = FileConfig::load("/nonexistent/config.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
