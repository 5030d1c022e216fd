//! Shared test utilities for core module tests
//!
//! Provides an in-memory netfilter and netlink so tests can check the state a
//! sequence of commands leaves behind, not just the commands themselves.
//! This module is only compiled in test mode.

use crate::config::Config;
use crate::core::rules::is_mesh_chain;
use crate::exec::{CommandError, CommandExecutor, CommandOutput, render_command};
use crate::netlink::{NetlinkError, NetlinkHandle, PolicyRule, Route};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, PoisonError};

pub const PROBE_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 7, 127);
pub const PROBE_V6: Ipv6Addr = Ipv6Addr::new(
    0xe9ac, 0x1e77, 0x90ca, 0x399f, 0x4d6d, 0xece2, 0x2f9b, 0x3164,
);
pub const HOST_PROBE_V6: Ipv6Addr = Ipv6Addr::new(
    0xfd16, 0x9254, 0x7127, 0x1337, 0xffff, 0xffff, 0xffff, 0xffff,
);

const BUILTIN_CHAINS: [&str; 5] = ["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];

/// Configuration used by the reference scenarios: DNS redirection on, IPv6 as given.
pub fn test_config(enable_ipv6: bool) -> Config {
    Config {
        redirect_dns: true,
        enable_ipv6,
        ..Config::default()
    }
}

/// Chain contents keyed by `(binary, table, chain)`
pub type FakeState = BTreeMap<(String, String, String), Vec<String>>;

/// In-memory iptables/ip6tables.
///
/// Understands `-N -F -X -A -I -D -S` with the error messages the real tools
/// print. Built-in chains always exist. Anything that is not an iptables
/// invocation succeeds and is only logged.
#[derive(Debug, Default)]
pub struct FakeNetfilter {
    chains: Mutex<FakeState>,
    log: Mutex<Vec<String>>,
}

impl FakeNetfilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> Vec<String> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Non-empty chains plus every user-defined chain
    pub fn snapshot(&self) -> FakeState {
        self.chains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((_, _, chain), rules)| !rules.is_empty() || !is_builtin(chain))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn rules(&self, binary: &str, table: &str, chain: &str) -> Vec<String> {
        self.chains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(binary, table, chain))
            .cloned()
            .unwrap_or_default()
    }

    pub fn chain_exists(&self, binary: &str, table: &str, chain: &str) -> bool {
        is_builtin(chain)
            || self
                .chains
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&key(binary, table, chain))
    }

    /// User-defined chains in any table of `binary`
    pub fn user_chains(&self, binary: &str) -> Vec<(String, String)> {
        self.chains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(b, _, chain)| b == binary && !is_builtin(chain))
            .map(|(_, table, chain)| (table.clone(), chain.clone()))
            .collect()
    }

    fn apply(&self, binary: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        let fail = |msg: String| Err(CommandError::failed(1, format!("{binary}: {msg}")));
        let [t, table, flag, chain, rest @ ..] = args else {
            return fail(format!("unsupported invocation {args:?}"));
        };
        if t != "-t" {
            return fail(format!("unsupported invocation {args:?}"));
        }

        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        let k = key(binary, table, chain);
        let exists = is_builtin(chain) || chains.contains_key(&k);
        let rule = rest.join(" ");

        if flag != "-N" && !exists {
            return fail("No chain/target/match by that name.".into());
        }

        match flag.as_str() {
            "-N" => {
                if exists {
                    return fail("Chain already exists.".into());
                }
                chains.insert(k, Vec::new());
            }
            "-F" => {
                chains.entry(k).or_default().clear();
            }
            "-X" => {
                if is_builtin(chain) {
                    return fail("Can't delete built-in chain.".into());
                }
                let jump = format!("-j {chain}");
                let referenced = chains.iter().any(|((b, tb, _), rules)| {
                    b == binary && tb == table && rules.iter().any(|r| r.ends_with(&jump))
                });
                if referenced {
                    return fail("Too many links.".into());
                }
                chains.remove(&k);
            }
            "-A" | "-I" => {
                if let Some(target) = jump_target(rest)
                    && is_mesh_chain(target)
                    && !chains.contains_key(&key(binary, table, target))
                {
                    return fail(format!("Couldn't load target `{target}'"));
                }
                let list = chains.entry(k).or_default();
                if flag == "-A" {
                    list.push(rule);
                } else {
                    list.insert(0, rule);
                }
            }
            "-D" => {
                let list = chains.entry(k).or_default();
                match list.iter().position(|r| *r == rule) {
                    Some(idx) => {
                        list.remove(idx);
                    }
                    None => {
                        return fail("Bad rule (does a matching rule exist in that chain?).".into());
                    }
                }
            }
            "-S" => {
                let mut out = if is_builtin(chain) {
                    format!("-P {chain} ACCEPT\n")
                } else {
                    format!("-N {chain}\n")
                };
                for r in chains.get(&k).into_iter().flatten() {
                    out.push_str(&format!("-A {chain} {r}\n"));
                }
                return Ok(CommandOutput::with_stdout(out));
            }
            other => return fail(format!("unknown option {other}")),
        }
        Ok(CommandOutput::default())
    }
}

impl CommandExecutor for FakeNetfilter {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(render_command(program, args));

        match program {
            "iptables" | "ip6tables" => self.apply(program, args),
            _ => Ok(CommandOutput::default()),
        }
    }
}

fn key(binary: &str, table: &str, chain: &str) -> (String, String, String) {
    (binary.to_string(), table.to_string(), chain.to_string())
}

fn is_builtin(chain: &str) -> bool {
    BUILTIN_CHAINS.contains(&chain)
}

fn jump_target(rest: &[String]) -> Option<&str> {
    rest.iter()
        .position(|a| a == "-j")
        .and_then(|i| rest.get(i + 1))
        .map(String::as_str)
}

/// In-memory policy rules and routes with kernel-like exists/missing errors
#[derive(Debug, Default)]
pub struct FakeNetlink {
    pub rules: Mutex<Vec<PolicyRule>>,
    pub routes: Mutex<Vec<Route>>,
    pub missing_links: Vec<String>,
}

impl FakeNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_link(name: &str) -> Self {
        Self {
            missing_links: vec![name.to_string()],
            ..Self::default()
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn add_unique<T: PartialEq + Clone>(list: &Mutex<Vec<T>>, item: &T) -> Result<(), NetlinkError> {
    let mut list = list.lock().unwrap_or_else(PoisonError::into_inner);
    if list.contains(item) {
        return Err(NetlinkError::Exists);
    }
    list.push(item.clone());
    Ok(())
}

fn remove_present<T: PartialEq>(list: &Mutex<Vec<T>>, item: &T) -> Result<(), NetlinkError> {
    let mut list = list.lock().unwrap_or_else(PoisonError::into_inner);
    let idx = list
        .iter()
        .position(|x| x == item)
        .ok_or(NetlinkError::NotFound)?;
    list.remove(idx);
    Ok(())
}

impl NetlinkHandle for FakeNetlink {
    fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        add_unique(&self.rules, rule)
    }

    fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        remove_present(&self.rules, rule)
    }

    fn add_route(&self, route: &Route) -> Result<(), NetlinkError> {
        add_unique(&self.routes, route)
    }

    fn del_route(&self, route: &Route) -> Result<(), NetlinkError> {
        remove_present(&self.routes, route)
    }

    fn link_exists(&self, name: &str) -> Result<bool, NetlinkError> {
        Ok(!self.missing_links.iter().any(|l| l == name))
    }
}
