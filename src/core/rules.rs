//! Firewall operation records and iptables argument rendering
//!
//! This module defines the data structures the rule builders produce. A
//! [`RuleOp`] is one netfilter mutation; nothing in here executes anything.
//!
//! # Operation Structure
//!
//! A [`RuleOp`] carries:
//! - The [`Table`] and chain it targets
//! - The [`Action`] (`-N`, `-F`, `-A`, `-I`, `-D`, `-X`)
//! - A [`RuleSpec`] of match arguments, built through typed helpers
//! - An optional [`Target`] (`-j ...`)
//! - The [`Stage`] of the builder that emitted it
//!
//! # Example
//!
//! ```
//! use meshfw::core::rules::{Protocol, RuleOp, RuleSpec, Stage, Table, Target, MESH_OUTPUT};
//!
//! let op = RuleOp::append(
//!     Table::Nat,
//!     MESH_OUTPUT,
//!     Stage::OutboundCapture,
//!     RuleSpec::new().protocol(Protocol::Tcp),
//!     Target::Redirect { port: 15001 },
//! );
//! assert_eq!(
//!     op.args().join(" "),
//!     "-t nat -A MESH_OUTPUT -p tcp -j REDIRECT --to-ports 15001"
//! );
//! ```

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// In-pod chain hooked from `PREROUTING` (mangle, raw)
pub const MESH_PRERT: &str = "MESH_PRERT";
/// In-pod chain hooked from `OUTPUT` (mangle, nat, raw)
pub const MESH_OUTPUT: &str = "MESH_OUTPUT";
/// Host chain hooked from nat `POSTROUTING`
pub const MESH_POSTRT: &str = "MESH_POSTRT";

pub const PREROUTING: &str = "PREROUTING";
pub const OUTPUT: &str = "OUTPUT";
pub const POSTROUTING: &str = "POSTROUTING";

pub const LOOPBACK_INTERFACE: &str = "lo";
pub const DNS_PORT: u16 = 53;
/// Conntrack zone isolating the proxy's upstream DNS flows from redirected ones
pub const DNS_CONNTRACK_ZONE: u16 = 1;

/// Every mesh-owned chain in the pod namespace, in reset order.
pub const INPOD_CHAINS: [(Table, &str); 5] = [
    (Table::Mangle, MESH_PRERT),
    (Table::Mangle, MESH_OUTPUT),
    (Table::Nat, MESH_OUTPUT),
    (Table::Raw, MESH_PRERT),
    (Table::Raw, MESH_OUTPUT),
];

/// Mesh-owned chains in the host namespace.
pub const HOST_CHAINS: [(Table, &str); 1] = [(Table::Nat, MESH_POSTRT)];

/// Returns true for chain names this crate owns and may flush or delete.
pub fn is_mesh_chain(chain: &str) -> bool {
    matches!(chain, MESH_PRERT | MESH_OUTPUT | MESH_POSTRT)
}

/// Address family; selects the binary and the loopback network.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::AsRefStr,
)]
pub enum IpFamily {
    #[strum(serialize = "ipv4")]
    V4,
    #[strum(serialize = "ipv6")]
    V6,
}

impl IpFamily {
    /// Name of the netfilter CLI for this family
    pub const fn iptables_binary(self) -> &'static str {
        match self {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    /// Family switch understood by iproute2
    pub const fn iproute_flag(self) -> &'static str {
        match self {
            IpFamily::V4 => "-4",
            IpFamily::V6 => "-6",
        }
    }

    /// Host route to the loopback address (`127.0.0.1/32` or `::1/128`)
    pub fn loopback_network(self) -> IpNetwork {
        match self {
            IpFamily::V4 => IpNetwork::from(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            IpFamily::V6 => IpNetwork::from(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        }
    }

    pub const fn unspecified(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Netfilter table
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::AsRefStr,
)]
pub enum Table {
    #[strum(serialize = "mangle")]
    Mangle,
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "raw")]
    Raw,
}

/// Chain-level mutation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    NewChain,
    Flush,
    Append,
    Insert,
    Delete,
    DeleteChain,
}

impl Action {
    pub const fn flag(self) -> &'static str {
        match self {
            Action::NewChain => "-N",
            Action::Flush => "-F",
            Action::Append => "-A",
            Action::Insert => "-I",
            Action::Delete => "-D",
            Action::DeleteChain => "-X",
        }
    }

    /// Whether the action carries a rule (match spec and target)
    pub const fn takes_rule(self) -> bool {
        matches!(self, Action::Append | Action::Insert | Action::Delete)
    }
}

/// Builder phase that produced an operation.
///
/// Declaration order is evaluation order: within one chain, an operation
/// never follows one from a later stage.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::Display,
    strum::AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Chains,
    Jumps,
    ProxyExemption,
    ProbeExemption,
    Dns,
    InboundCapture,
    OutboundCapture,
    Teardown,
}

impl Stage {
    /// Stages holding general capture rules
    pub const fn is_capture(self) -> bool {
        matches!(self, Stage::InboundCapture | Stage::OutboundCapture)
    }

    /// Stages holding exemption rules that must precede any capture
    pub const fn is_exemption(self) -> bool {
        matches!(self, Stage::ProxyExemption | Stage::ProbeExemption)
    }
}

/// Firewall mark with mask, rendered as `0x539/0xfff`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Mark {
    pub value: u32,
    pub mask: u32,
}

impl Mark {
    pub const fn new(value: u32, mask: u32) -> Self {
        Self { value, mask }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.value, self.mask)
    }
}

/// Transport protocol for `-p` and port matches
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::AsRefStr)]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

/// Ordered match arguments of a rule.
///
/// Helpers append in call order, so the rendered rule reads exactly as the
/// builder wrote it.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RuleSpec(Vec<String>);

impl RuleSpec {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, args: &[&str]) -> Self {
        self.0.extend(args.iter().map(|a| (*a).to_string()));
        self
    }

    pub fn source(self, addr: IpAddr) -> Self {
        self.push(&["-s", &addr.to_string()])
    }

    pub fn destination(self, addr: IpAddr) -> Self {
        self.push(&["-d", &addr.to_string()])
    }

    pub fn not_destination(self, net: IpNetwork) -> Self {
        self.push(&["!", "-d", &net.to_string()])
    }

    pub fn in_interface(self, name: &str) -> Self {
        self.push(&["-i", name])
    }

    pub fn out_interface(self, name: &str) -> Self {
        self.push(&["-o", name])
    }

    pub fn not_out_interface(self, name: &str) -> Self {
        self.push(&["!", "-o", name])
    }

    pub fn protocol(self, proto: Protocol) -> Self {
        self.push(&["-p", proto.as_ref()])
    }

    /// Loads the protocol match module without further options (`-m tcp`)
    pub fn protocol_match(self, proto: Protocol) -> Self {
        self.push(&["-m", proto.as_ref()])
    }

    pub fn destination_port(self, proto: Protocol, port: u16) -> Self {
        self.push(&["-m", proto.as_ref(), "--dport", &port.to_string()])
    }

    pub fn source_port(self, proto: Protocol, port: u16) -> Self {
        self.push(&["-m", proto.as_ref(), "--sport", &port.to_string()])
    }

    pub fn mark(self, mark: Mark) -> Self {
        self.push(&["-m", "mark", "--mark", &mark.to_string()])
    }

    pub fn not_mark(self, mark: Mark) -> Self {
        self.push(&["-m", "mark", "!", "--mark", &mark.to_string()])
    }

    pub fn connmark(self, mark: Mark) -> Self {
        self.push(&["-m", "connmark", "--mark", &mark.to_string()])
    }

    pub fn uid_owner(self, uid: u32) -> Self {
        self.push(&["-m", "owner", "--uid-owner", &uid.to_string()])
    }

    pub fn gid_owner(self, gid: u32) -> Self {
        self.push(&["-m", "owner", "--gid-owner", &gid.to_string()])
    }

    pub fn socket_exists(self) -> Self {
        self.push(&["-m", "owner", "--socket-exists"])
    }

    pub fn ctstate(self, states: &str) -> Self {
        self.push(&["-m", "conntrack", "--ctstate", states])
    }

    /// Matches the destination address against a named ipset
    pub fn dst_in_set(self, set: &str) -> Self {
        self.push(&["-m", "set", "--match-set", set, "dst"])
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }
}

/// Rule verdict or extension target (`-j ...`)
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum Target {
    Accept,
    Return,
    Jump(&'static str),
    Redirect { port: u16 },
    Tproxy { port: u16, mark: Mark },
    SetConnmark { mark: Mark },
    /// Copies the connection mark back onto the packet
    RestoreConnmark,
    ConntrackZone { zone: u16 },
    Snat { source: IpAddr },
}

impl Target {
    pub fn args(&self) -> Vec<String> {
        let parts: Vec<String> = match self {
            Target::Accept => vec!["ACCEPT".into()],
            Target::Return => vec!["RETURN".into()],
            Target::Jump(chain) => vec![(*chain).to_string()],
            Target::Redirect { port } => {
                vec!["REDIRECT".into(), "--to-ports".into(), port.to_string()]
            }
            Target::Tproxy { port, mark } => vec![
                "TPROXY".into(),
                "--on-port".into(),
                port.to_string(),
                "--tproxy-mark".into(),
                mark.to_string(),
            ],
            Target::SetConnmark { mark } => {
                vec!["CONNMARK".into(), "--set-xmark".into(), mark.to_string()]
            }
            Target::RestoreConnmark => vec![
                "CONNMARK".into(),
                "--restore-mark".into(),
                "--nfmask".into(),
                "0xffffffff".into(),
                "--ctmask".into(),
                "0xffffffff".into(),
            ],
            Target::ConntrackZone { zone } => {
                vec!["CT".into(), "--zone".into(), zone.to_string()]
            }
            Target::Snat { source } => {
                vec!["SNAT".into(), "--to-source".into(), source.to_string()]
            }
        };
        parts
    }
}

/// One netfilter mutation, in the order the builder emitted it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuleOp {
    pub table: Table,
    pub chain: &'static str,
    pub action: Action,
    pub spec: RuleSpec,
    pub target: Option<Target>,
    pub stage: Stage,
}

impl RuleOp {
    pub fn new_chain(table: Table, chain: &'static str) -> Self {
        Self::bare(table, chain, Action::NewChain, Stage::Chains)
    }

    pub fn flush(table: Table, chain: &'static str) -> Self {
        Self::bare(table, chain, Action::Flush, Stage::Chains)
    }

    pub fn delete_chain(table: Table, chain: &'static str) -> Self {
        Self::bare(table, chain, Action::DeleteChain, Stage::Teardown)
    }

    pub fn append(
        table: Table,
        chain: &'static str,
        stage: Stage,
        spec: RuleSpec,
        target: Target,
    ) -> Self {
        Self {
            table,
            chain,
            action: Action::Append,
            spec,
            target: Some(target),
            stage,
        }
    }

    /// Head-of-chain jump from a built-in chain into a mesh chain
    pub fn insert_jump(table: Table, builtin: &'static str, mesh_chain: &'static str) -> Self {
        Self {
            table,
            chain: builtin,
            action: Action::Insert,
            spec: RuleSpec::new(),
            target: Some(Target::Jump(mesh_chain)),
            stage: Stage::Jumps,
        }
    }

    pub fn delete_jump(table: Table, builtin: &'static str, mesh_chain: &'static str) -> Self {
        Self {
            action: Action::Delete,
            stage: Stage::Teardown,
            ..Self::insert_jump(table, builtin, mesh_chain)
        }
    }

    fn bare(table: Table, chain: &'static str, action: Action, stage: Stage) -> Self {
        Self {
            table,
            chain,
            action,
            spec: RuleSpec::new(),
            target: None,
            stage,
        }
    }

    fn rule_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.spec.args().to_vec();
        if let Some(target) = &self.target {
            args.push("-j".into());
            args.extend(target.args());
        }
        args
    }

    /// Arguments passed to `iptables`/`ip6tables`
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.to_string(),
            self.action.flag().to_string(),
            self.chain.to_string(),
        ];
        if self.action.takes_rule() {
            args.extend(self.rule_args());
        }
        args
    }

    /// Arguments listing the chain this operation targets (`-S <chain>`)
    pub fn list_args(&self) -> Vec<String> {
        vec![
            "-t".to_string(),
            self.table.to_string(),
            "-S".to_string(),
            self.chain.to_string(),
        ]
    }

    /// The line `iptables -S` prints once this rule is installed
    pub fn saved_form(&self) -> String {
        let mut parts = vec!["-A".to_string(), self.chain.to_string()];
        parts.extend(self.rule_args());
        parts.join(" ")
    }
}
