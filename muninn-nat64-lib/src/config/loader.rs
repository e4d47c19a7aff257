use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{Nat64Error, Result};
use crate::instance::MAX_INSTANCE_NAME_LEN;
use crate::rfc6052;

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| Nat64Error::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| Nat64Error::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    let mut names = HashSet::new();

    for instance in &cfg.instances {
        if instance.name.is_empty() || instance.name.len() > MAX_INSTANCE_NAME_LEN {
            return Err(Nat64Error::Config(format!(
                "instance name '{}' must be 1-{} bytes",
                instance.name, MAX_INSTANCE_NAME_LEN
            )));
        }
        if !names.insert(instance.name.as_str()) {
            return Err(Nat64Error::Config(format!(
                "duplicate instance name '{}'",
                instance.name
            )));
        }

        match &instance.global.pool6 {
            None => {
                return Err(Nat64Error::Config(format!(
                    "instance '{}' has no pool6 prefix",
                    instance.name
                )));
            }
            Some(prefix) if !rfc6052::is_valid_prefix(prefix) => {
                return Err(Nat64Error::Config(format!(
                    "instance '{}': {} is not a valid RFC 6052 prefix length",
                    instance.name, prefix
                )));
            }
            Some(_) => {}
        }

        if instance.global.translate.min_ipv6_mtu < 1280 {
            return Err(Nat64Error::Config(format!(
                "instance '{}': min-ipv6-mtu must be at least 1280",
                instance.name
            )));
        }
        crate::config::normalize_plateaus(instance.global.translate.mtu_plateaus.clone())
            .map_err(|e| {
                Nat64Error::Config(format!("instance '{}': {e}", instance.name))
            })?;

        for slice in &instance.pool4 {
            if slice.ports.min > slice.ports.max {
                return Err(Nat64Error::Config(format!(
                    "instance '{}': pool4 port range {} is inverted",
                    instance.name, slice.ports
                )));
            }
        }
    }

    Ok(())
}
