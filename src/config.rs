use crate::core::error::{Error, Result};
use crate::core::rules::Mark;
use crate::validators;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node-agent configuration for traffic capture
///
/// Read once at startup and never mutated. Missing fields in a config file
/// take the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Redirect port 53 to the proxy DNS listener (outbound capture only)
    #[serde(default)]
    pub redirect_dns: bool,
    /// Gate every IPv6 rule, route and command
    #[serde(default)]
    pub enable_ipv6: bool,
    #[serde(default = "default_proxy_id")]
    pub proxy_uid: u32,
    #[serde(default = "default_proxy_id")]
    pub proxy_gid: u32,
    /// Plaintext inbound listener (TPROXY)
    #[serde(default = "default_inbound_port")]
    pub inbound_port: u16,
    /// Tunnel inbound listener (TPROXY)
    #[serde(default = "default_inbound_tunnel_port")]
    pub inbound_tunnel_port: u16,
    /// Outbound listener (REDIRECT)
    #[serde(default = "default_outbound_port")]
    pub outbound_port: u16,
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    /// Socket mark the proxy puts on its own traffic
    #[serde(default = "default_proxy_mark")]
    pub proxy_mark: Mark,
    /// Mark set on TPROXY'd packets and their connections
    #[serde(default = "default_tproxy_mark")]
    pub tproxy_mark: Mark,
    #[serde(default = "default_route_table")]
    pub route_table: u32,
    #[serde(default = "default_rule_priority")]
    pub rule_priority: u32,
    #[serde(default = "default_probe_ipset_v4")]
    pub probe_ipset_v4: String,
    #[serde(default = "default_probe_ipset_v6")]
    pub probe_ipset_v6: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redirect_dns: false,
            enable_ipv6: false,
            proxy_uid: default_proxy_id(),
            proxy_gid: default_proxy_id(),
            inbound_port: default_inbound_port(),
            inbound_tunnel_port: default_inbound_tunnel_port(),
            outbound_port: default_outbound_port(),
            dns_port: default_dns_port(),
            proxy_mark: default_proxy_mark(),
            tproxy_mark: default_tproxy_mark(),
            route_table: default_route_table(),
            rule_priority: default_rule_priority(),
            probe_ipset_v4: default_probe_ipset_v4(),
            probe_ipset_v6: default_probe_ipset_v6(),
        }
    }
}

fn default_proxy_id() -> u32 {
    1337
}

fn default_inbound_port() -> u16 {
    15006
}

fn default_inbound_tunnel_port() -> u16 {
    15008
}

fn default_outbound_port() -> u16 {
    15001
}

fn default_dns_port() -> u16 {
    15053
}

fn default_proxy_mark() -> Mark {
    Mark::new(0x539, 0xfff)
}

fn default_tproxy_mark() -> Mark {
    Mark::new(0x111, 0xfff)
}

fn default_route_table() -> u32 {
    100
}

fn default_rule_priority() -> u32 {
    32764
}

fn default_probe_ipset_v4() -> String {
    "meshfw-probes-v4".to_string()
}

fn default_probe_ipset_v6() -> String {
    "meshfw-probes-v6".to_string()
}

impl Config {
    /// Checks every field that ends up on a command line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        for (field, port) in self.ports() {
            validators::validate_port(port).map_err(|e| Error::config(field, e))?;
        }
        validators::validate_distinct_ports(&self.ports())
            .map_err(|e| Error::config("ports", e))?;

        if self.proxy_uid == 0 {
            return Err(Error::config("proxy_uid", "must be non-zero (root is never exempt)"));
        }
        if self.proxy_gid == 0 {
            return Err(Error::config("proxy_gid", "must be non-zero (root is never exempt)"));
        }

        validators::validate_mark(self.proxy_mark).map_err(|e| Error::config("proxy_mark", e))?;
        validators::validate_mark(self.tproxy_mark)
            .map_err(|e| Error::config("tproxy_mark", e))?;
        if self.proxy_mark == self.tproxy_mark {
            return Err(Error::config(
                "tproxy_mark",
                format!("must differ from proxy_mark ({})", self.proxy_mark),
            ));
        }

        validators::validate_route_table(self.route_table)
            .map_err(|e| Error::config("route_table", e))?;
        validators::validate_ipset_name(&self.probe_ipset_v4)
            .map_err(|e| Error::config("probe_ipset_v4", e))?;
        validators::validate_ipset_name(&self.probe_ipset_v6)
            .map_err(|e| Error::config("probe_ipset_v6", e))?;

        Ok(())
    }

    fn ports(&self) -> [(&'static str, u16); 4] {
        [
            ("inbound_port", self.inbound_port),
            ("inbound_tunnel_port", self.inbound_tunnel_port),
            ("outbound_port", self.outbound_port),
            ("dns_port", self.dns_port),
        ]
    }
}

/// Loads and validates a JSON config file.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read, [`Error::Serialization`]
/// for malformed JSON or unknown fields, and [`Error::Config`] if validation fails.
pub fn load_config(path: &Path) -> Result<Config> {
    let json = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&json)?;
    config.validate()?;
    Ok(config)
}
