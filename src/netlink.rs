//! Namespace-scoped policy routing
//!
//! TPROXY delivers intercepted packets to a local socket only if the kernel
//! routes them locally, which takes a fwmark policy rule plus a `local`
//! default route in a dedicated table. Those live in the routing subsystem,
//! not in netfilter, so they go through a [`NetlinkHandle`].
//!
//! - [`EmptyNetlink`] does nothing (tests, dry runs, hosts that manage routing elsewhere)
//! - [`IprouteNetlink`] drives iproute2 through a [`CommandExecutor`]

use crate::core::rules::{IpFamily, LOOPBACK_INTERFACE, Mark};
use crate::exec::{CommandError, CommandExecutor};
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Policy routing rule selecting a table by firewall mark
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyRule {
    pub family: IpFamily,
    pub priority: u32,
    pub mark: Mark,
    pub table: u32,
}

/// `local` route in a specific table; matching packets go to the local stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub family: IpFamily,
    pub destination: IpNetwork,
    pub device: String,
    pub table: u32,
}

impl Route {
    /// `local 0.0.0.0/0 dev lo table <table>` (or `::/0` for IPv6)
    pub fn local_default(family: IpFamily, table: u32) -> Result<Self, NetlinkError> {
        let destination = IpNetwork::new(family.unspecified(), 0)
            .map_err(|e| NetlinkError::Invalid(e.to_string()))?;
        Ok(Self {
            family,
            destination,
            device: LOOPBACK_INTERFACE.to_string(),
            table,
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "local {} dev {} table {}",
            self.destination, self.device, self.table
        )
    }
}

/// Error type for netlink operations
#[derive(Debug, thiserror::Error)]
pub enum NetlinkError {
    /// The object is already present
    #[error("already exists")]
    Exists,

    /// The object (or the device it references) is absent
    #[error("not found")]
    NotFound,

    /// Request could not be expressed
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Transport failure
    #[error(transparent)]
    Command(CommandError),
}

/// Route and link access scoped to one network namespace
pub trait NetlinkHandle {
    fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError>;
    fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError>;
    fn add_route(&self, route: &Route) -> Result<(), NetlinkError>;
    fn del_route(&self, route: &Route) -> Result<(), NetlinkError>;
    fn link_exists(&self, name: &str) -> Result<bool, NetlinkError>;
}

impl<T: NetlinkHandle + ?Sized> NetlinkHandle for &T {
    fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        (**self).add_rule(rule)
    }

    fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        (**self).del_rule(rule)
    }

    fn add_route(&self, route: &Route) -> Result<(), NetlinkError> {
        (**self).add_route(route)
    }

    fn del_route(&self, route: &Route) -> Result<(), NetlinkError> {
        (**self).del_route(route)
    }

    fn link_exists(&self, name: &str) -> Result<bool, NetlinkError> {
        (**self).link_exists(name)
    }
}

/// Accepts every request and changes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyNetlink;

impl NetlinkHandle for EmptyNetlink {
    fn add_rule(&self, _rule: &PolicyRule) -> Result<(), NetlinkError> {
        Ok(())
    }

    fn del_rule(&self, _rule: &PolicyRule) -> Result<(), NetlinkError> {
        Ok(())
    }

    fn add_route(&self, _route: &Route) -> Result<(), NetlinkError> {
        Ok(())
    }

    fn del_route(&self, _route: &Route) -> Result<(), NetlinkError> {
        Ok(())
    }

    fn link_exists(&self, _name: &str) -> Result<bool, NetlinkError> {
        Ok(true)
    }
}

/// Netlink access through the `ip` binary
#[derive(Debug, Clone)]
pub struct IprouteNetlink<E> {
    executor: E,
}

impl<E: CommandExecutor> IprouteNetlink<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn ip(&self, family: IpFamily, args: &[String]) -> Result<String, NetlinkError> {
        let mut full = vec![family.iproute_flag().to_string()];
        full.extend_from_slice(args);
        self.executor
            .run("ip", &full)
            .map(|out| out.stdout)
            .map_err(|e| {
                if e.is_already_exists() {
                    NetlinkError::Exists
                } else if e.is_missing() {
                    NetlinkError::NotFound
                } else {
                    NetlinkError::Command(e)
                }
            })
    }

    fn rule_args(verb: &str, rule: &PolicyRule) -> Vec<String> {
        vec![
            "rule".into(),
            verb.into(),
            "fwmark".into(),
            rule.mark.to_string(),
            "lookup".into(),
            rule.table.to_string(),
            "pref".into(),
            rule.priority.to_string(),
        ]
    }

    fn route_args(verb: &str, route: &Route) -> Vec<String> {
        vec![
            "route".into(),
            verb.into(),
            "local".into(),
            route.destination.to_string(),
            "dev".into(),
            route.device.clone(),
            "table".into(),
            route.table.to_string(),
        ]
    }
}

impl<E: CommandExecutor> NetlinkHandle for IprouteNetlink<E> {
    fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        self.ip(rule.family, &Self::rule_args("add", rule)).map(|_| ())
    }

    fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        self.ip(rule.family, &Self::rule_args("del", rule)).map(|_| ())
    }

    fn add_route(&self, route: &Route) -> Result<(), NetlinkError> {
        self.ip(route.family, &Self::route_args("add", route)).map(|_| ())
    }

    fn del_route(&self, route: &Route) -> Result<(), NetlinkError> {
        self.ip(route.family, &Self::route_args("del", route)).map(|_| ())
    }

    fn link_exists(&self, name: &str) -> Result<bool, NetlinkError> {
        let args = vec!["link".to_string(), "show".into(), "dev".into(), name.into()];
        match self.ip(IpFamily::V4, &args) {
            Ok(_) => Ok(true),
            Err(NetlinkError::NotFound) => {
                debug!("link {name} not present");
                Ok(false)
            }
            Err(NetlinkError::Command(e))
                if e.stderr().is_some_and(|s| s.contains("does not exist")) =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
