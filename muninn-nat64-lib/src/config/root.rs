use std::path::PathBuf;

use ipnet::Ipv4Net;
use serde::Deserialize;

use super::global::GlobalConfig;
use crate::types::{L4Proto, PortRange};

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/muninn-nat64.sock")
}

/// Daemon bootstrap configuration (the TOML file). Everything in here
/// can also be reached through the control plane afterwards.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Unix socket the control plane listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Translator instances to create on startup.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    /// Instance name; at most 15 bytes.
    pub name: String,
    #[serde(default)]
    pub global: GlobalConfig,
    /// Initial pool4 slices.
    #[serde(default)]
    pub pool4: Vec<Pool4SliceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pool4SliceConfig {
    #[serde(default)]
    pub mark: u32,
    pub proto: L4Proto,
    pub prefix: Ipv4Net,
    pub ports: PortRange,
}
