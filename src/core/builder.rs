//! Pure rule builders
//!
//! Each builder turns a [`Config`], a family and runtime inputs into the
//! ordered list of [`RuleOp`]s for that family. Nothing here executes or
//! checks kernel state; that is the guard's and the applier's job.
//!
//! Within every chain the emitted stages never decrease, so exemptions always
//! sit above the capture rules they protect.

use crate::config::Config;
use crate::core::rules::{
    DNS_CONNTRACK_ZONE, DNS_PORT, HOST_CHAINS, INPOD_CHAINS, IpFamily, LOOPBACK_INTERFACE,
    MESH_OUTPUT, MESH_POSTRT, MESH_PRERT, OUTPUT, POSTROUTING, PREROUTING, Protocol, RuleOp,
    RuleSpec, Stage, Table, Target,
};
use std::net::IpAddr;

/// Built-in to mesh chain hooks in the pod namespace, in install order.
pub const INPOD_JUMPS: [(Table, &str, &str); 5] = [
    (Table::Mangle, PREROUTING, MESH_PRERT),
    (Table::Mangle, OUTPUT, MESH_OUTPUT),
    (Table::Nat, OUTPUT, MESH_OUTPUT),
    (Table::Raw, PREROUTING, MESH_PRERT),
    (Table::Raw, OUTPUT, MESH_OUTPUT),
];

/// Built-in to mesh chain hooks in the host namespace.
pub const HOST_JUMPS: [(Table, &str, &str); 1] = [(Table::Nat, POSTROUTING, MESH_POSTRT)];

/// Per-call switches derived from the config and the mode flag
#[derive(Debug, Clone, Copy)]
struct Features {
    /// Outbound interception (nat OUTPUT) is active
    outbound: bool,
    /// DNS redirection and conntrack zoning are active
    dns: bool,
}

impl Features {
    fn new(config: &Config, ingress_mode: bool) -> Self {
        Self {
            outbound: !ingress_mode,
            dns: config.redirect_dns && !ingress_mode,
        }
    }

    fn uses(self, table: Table) -> bool {
        match table {
            Table::Mangle => true,
            Table::Nat => self.outbound,
            Table::Raw => self.dns,
        }
    }
}

/// Whether any work is done for `family` under `config`
pub fn family_enabled(config: &Config, family: IpFamily) -> bool {
    family == IpFamily::V4 || config.enable_ipv6
}

/// Builds the in-pod capture rule set for one family.
///
/// `probe` is the node's health-probe source address for this family.
/// Returns an empty list for IPv6 when IPv6 is disabled.
pub fn inpod_rules(
    config: &Config,
    family: IpFamily,
    probe: IpAddr,
    ingress_mode: bool,
) -> Vec<RuleOp> {
    if !family_enabled(config, family) {
        return Vec::new();
    }

    let features = Features::new(config, ingress_mode);
    let mut ops = Vec::with_capacity(48);

    // 1. Reset every mesh chain, including ones this mode leaves unused
    add_chain_resets(&mut ops, &INPOD_CHAINS);

    // 2. Hook the chains in use
    for (table, builtin, mesh) in INPOD_JUMPS {
        if features.uses(table) {
            ops.push(RuleOp::insert_jump(table, builtin, mesh));
        }
    }

    // 3. Proxy and loopback exemptions
    add_proxy_exemptions(&mut ops, config, family, features);

    // 4. Health probes from the node
    add_probe_exemptions(&mut ops, probe, features);

    // 5. DNS
    if features.dns {
        add_dns_rules(&mut ops, config);
    }

    // 6. Inbound capture
    add_inbound_capture(&mut ops, config, family);

    // 7. Outbound capture
    if features.outbound {
        ops.push(RuleOp::append(
            Table::Nat,
            MESH_OUTPUT,
            Stage::OutboundCapture,
            RuleSpec::new()
                .not_destination(family.loopback_network())
                .protocol(Protocol::Tcp),
            Target::Redirect {
                port: config.outbound_port,
            },
        ));
    }

    ops
}

/// Builds the host-namespace probe SNAT rule set for one family.
///
/// Node-originated probes to captured pods leave with `probe` as their source
/// so the in-pod exemption recognises them.
pub fn host_rules(config: &Config, family: IpFamily, probe: IpAddr) -> Vec<RuleOp> {
    if !family_enabled(config, family) {
        return Vec::new();
    }

    let ipset = match family {
        IpFamily::V4 => &config.probe_ipset_v4,
        IpFamily::V6 => &config.probe_ipset_v6,
    };

    let mut ops = Vec::with_capacity(4);
    add_chain_resets(&mut ops, &HOST_CHAINS);
    for (table, builtin, mesh) in HOST_JUMPS {
        ops.push(RuleOp::insert_jump(table, builtin, mesh));
    }
    ops.push(RuleOp::append(
        Table::Nat,
        MESH_POSTRT,
        Stage::ProbeExemption,
        RuleSpec::new()
            .socket_exists()
            .protocol(Protocol::Tcp)
            .dst_in_set(ipset),
        Target::Snat { source: probe },
    ));
    ops
}

/// Removes every in-pod jump and mesh chain for one family.
pub fn inpod_teardown(config: &Config, family: IpFamily) -> Vec<RuleOp> {
    if !family_enabled(config, family) {
        return Vec::new();
    }
    teardown(&INPOD_JUMPS, &INPOD_CHAINS)
}

/// Removes the host probe jump and chain for one family.
pub fn host_teardown(config: &Config, family: IpFamily) -> Vec<RuleOp> {
    if !family_enabled(config, family) {
        return Vec::new();
    }
    teardown(&HOST_JUMPS, &HOST_CHAINS)
}

fn add_chain_resets(ops: &mut Vec<RuleOp>, chains: &[(Table, &'static str)]) {
    for &(table, chain) in chains {
        ops.push(RuleOp::new_chain(table, chain));
        ops.push(RuleOp::flush(table, chain));
    }
}

fn teardown(
    jumps: &[(Table, &'static str, &'static str)],
    chains: &[(Table, &'static str)],
) -> Vec<RuleOp> {
    let mut ops = Vec::with_capacity(jumps.len() + chains.len() * 2);

    // Unhook first; a referenced chain cannot be deleted
    for &(table, builtin, mesh) in jumps {
        ops.push(RuleOp::delete_jump(table, builtin, mesh));
    }
    for &(table, chain) in chains {
        ops.push(RuleOp {
            stage: Stage::Teardown,
            ..RuleOp::flush(table, chain)
        });
    }
    for &(table, chain) in chains {
        ops.push(RuleOp::delete_chain(table, chain));
    }
    ops
}

fn add_proxy_exemptions(ops: &mut Vec<RuleOp>, config: &Config, family: IpFamily, features: Features) {
    let lo = family.loopback_network();
    let exempt = |table, chain, spec, target| {
        RuleOp::append(table, chain, Stage::ProxyExemption, spec, target)
    };

    // Packets the proxy sends to itself keep their connection tagged for TPROXY replies
    ops.push(exempt(
        Table::Mangle,
        MESH_PRERT,
        RuleSpec::new().mark(config.proxy_mark),
        Target::SetConnmark {
            mark: config.tproxy_mark,
        },
    ));
    ops.push(exempt(
        Table::Mangle,
        MESH_PRERT,
        RuleSpec::new()
            .not_destination(lo)
            .in_interface(LOOPBACK_INTERFACE)
            .protocol(Protocol::Tcp),
        Target::Accept,
    ));
    ops.push(exempt(
        Table::Mangle,
        MESH_OUTPUT,
        RuleSpec::new().connmark(config.tproxy_mark),
        Target::RestoreConnmark,
    ));

    if !features.outbound {
        return;
    }

    ops.push(exempt(
        Table::Nat,
        MESH_OUTPUT,
        RuleSpec::new().uid_owner(config.proxy_uid),
        Target::Return,
    ));
    ops.push(exempt(
        Table::Nat,
        MESH_OUTPUT,
        RuleSpec::new().gid_owner(config.proxy_gid),
        Target::Return,
    ));
    ops.push(exempt(
        Table::Nat,
        MESH_OUTPUT,
        RuleSpec::new().mark(config.proxy_mark),
        Target::Return,
    ));
    // Replies on connections that were TPROXY'd inbound
    ops.push(exempt(
        Table::Nat,
        MESH_OUTPUT,
        RuleSpec::new()
            .protocol(Protocol::Tcp)
            .mark(config.tproxy_mark),
        Target::Accept,
    ));
    ops.push(exempt(
        Table::Nat,
        MESH_OUTPUT,
        RuleSpec::new().not_destination(lo).out_interface(LOOPBACK_INTERFACE),
        Target::Accept,
    ));
}

fn add_probe_exemptions(ops: &mut Vec<RuleOp>, probe: IpAddr, features: Features) {
    ops.push(RuleOp::append(
        Table::Mangle,
        MESH_PRERT,
        Stage::ProbeExemption,
        RuleSpec::new()
            .source(probe)
            .protocol(Protocol::Tcp)
            .protocol_match(Protocol::Tcp),
        Target::Accept,
    ));
    if features.outbound {
        ops.push(RuleOp::append(
            Table::Nat,
            MESH_OUTPUT,
            Stage::ProbeExemption,
            RuleSpec::new()
                .destination(probe)
                .protocol(Protocol::Tcp)
                .protocol_match(Protocol::Tcp),
            Target::Accept,
        ));
    }
}

fn add_dns_rules(ops: &mut Vec<RuleOp>, config: &Config) {
    for proto in [Protocol::Udp, Protocol::Tcp] {
        ops.push(RuleOp::append(
            Table::Nat,
            MESH_OUTPUT,
            Stage::Dns,
            RuleSpec::new()
                .not_out_interface(LOOPBACK_INTERFACE)
                .protocol(proto)
                .destination_port(proto, DNS_PORT),
            Target::Redirect {
                port: config.dns_port,
            },
        ));
    }

    // Replies to the proxy's own upstream queries must not be matched
    // against the redirected flows' conntrack entries
    ops.push(RuleOp::append(
        Table::Raw,
        MESH_PRERT,
        Stage::Dns,
        RuleSpec::new()
            .protocol(Protocol::Udp)
            .not_mark(config.proxy_mark)
            .source_port(Protocol::Udp, DNS_PORT),
        Target::ConntrackZone {
            zone: DNS_CONNTRACK_ZONE,
        },
    ));
    ops.push(RuleOp::append(
        Table::Raw,
        MESH_OUTPUT,
        Stage::Dns,
        RuleSpec::new()
            .protocol(Protocol::Udp)
            .mark(config.proxy_mark)
            .destination_port(Protocol::Udp, DNS_PORT),
        Target::ConntrackZone {
            zone: DNS_CONNTRACK_ZONE,
        },
    ));
}

fn add_inbound_capture(ops: &mut Vec<RuleOp>, config: &Config, family: IpFamily) {
    let tproxy = |port| Target::Tproxy {
        port,
        mark: config.tproxy_mark,
    };

    ops.push(RuleOp::append(
        Table::Mangle,
        MESH_PRERT,
        Stage::InboundCapture,
        RuleSpec::new()
            .protocol(Protocol::Tcp)
            .destination_port(Protocol::Tcp, config.inbound_tunnel_port)
            .not_mark(config.proxy_mark),
        tproxy(config.inbound_tunnel_port),
    ));
    ops.push(RuleOp::append(
        Table::Mangle,
        MESH_PRERT,
        Stage::InboundCapture,
        RuleSpec::new()
            .protocol(Protocol::Tcp)
            .ctstate("RELATED,ESTABLISHED"),
        Target::Accept,
    ));
    ops.push(RuleOp::append(
        Table::Mangle,
        MESH_PRERT,
        Stage::InboundCapture,
        RuleSpec::new()
            .not_destination(family.loopback_network())
            .protocol(Protocol::Tcp)
            .not_mark(config.proxy_mark),
        tproxy(config.inbound_port),
    ));
}
