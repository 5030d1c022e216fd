use crate::config::Config;
use crate::core::builder::{INPOD_JUMPS, inpod_rules};
use crate::core::configurator::Configurator;
use crate::core::error::Error;
use crate::core::guard::{Intent, guard};
use crate::core::rules::{Action, IpFamily, RuleOp, Stage, Table};
use crate::core::test_helpers::{
    FakeNetfilter, FakeNetlink, HOST_PROBE_V6, PROBE_V4, PROBE_V6, test_config,
};
use crate::exec::StubExecutor;
use crate::netlink::EmptyNetlink;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

fn probe_for(family: IpFamily) -> IpAddr {
    match family {
        IpFamily::V4 => PROBE_V4.into(),
        IpFamily::V6 => PROBE_V6.into(),
    }
}

/// Panics if any chain sees a stage after a later one, or an exemption after a capture.
fn assert_chain_order(ops: &[RuleOp]) {
    let mut last: HashMap<(Table, &str), Stage> = HashMap::new();
    for op in ops {
        let key = (op.table, op.chain);
        if let Some(prev) = last.get(&key) {
            assert!(
                op.stage >= *prev,
                "{} after {prev} in {} {}",
                op.stage,
                op.table,
                op.chain
            );
            assert!(
                !(op.stage.is_exemption() && prev.is_capture()),
                "exemption after capture in {} {}",
                op.table,
                op.chain
            );
        }
        last.insert(key, op.stage);
    }
}

fn jump_count(fake: &FakeNetfilter, binary: &str, table: &str, builtin: &str, mesh: &str) -> usize {
    let jump = format!("-j {mesh}");
    fake.rules(binary, table, builtin)
        .iter()
        .filter(|r| **r == jump)
        .count()
}

// ═══════════════════════════════════════════════════════════════════════════
// Builder ordering
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_stage_order_in_every_combination() {
    for redirect_dns in [false, true] {
        for ingress_mode in [false, true] {
            for family in [IpFamily::V4, IpFamily::V6] {
                let config = Config {
                    redirect_dns,
                    enable_ipv6: true,
                    ..Config::default()
                };
                let ops = inpod_rules(&config, family, probe_for(family), ingress_mode);
                assert!(!ops.is_empty());
                assert_chain_order(&ops);
            }
        }
    }
}

#[test]
fn test_probe_exemption_precedes_capture() {
    let ops = inpod_rules(&test_config(false), IpFamily::V4, PROBE_V4.into(), false);
    let position = |pred: &dyn Fn(&RuleOp) -> bool| ops.iter().position(pred).unwrap();

    let probe = position(&|op: &RuleOp| op.stage == Stage::ProbeExemption && op.table == Table::Mangle);
    let inbound = position(&|op: &RuleOp| op.stage == Stage::InboundCapture);
    let outbound = position(&|op: &RuleOp| op.stage == Stage::OutboundCapture);
    let uid = position(&|op: &RuleOp| op.args().join(" ").contains("--uid-owner 1337"));

    assert!(probe < inbound);
    assert!(uid < outbound);
}

#[test]
fn test_builder_output_passes_guard() {
    for ingress_mode in [false, true] {
        let ops = inpod_rules(&test_config(true), IpFamily::V6, PROBE_V6.into(), ingress_mode);
        assert!(guard(IpFamily::V6, ops, Intent::Install).is_ok());
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Family gating and validation
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_ipv6_disabled_never_runs_ip6tables() {
    let stub = StubExecutor::new();
    let cfg = Configurator::new(test_config(false), &stub, EmptyNetlink).unwrap();
    cfg.create_inpod_rules(PROBE_V4, Some(PROBE_V6), false).unwrap();
    cfg.create_host_rules_for_health_checks(Some(PROBE_V4), Some(HOST_PROBE_V6))
        .unwrap();
    cfg.delete_inpod_rules().unwrap();

    let log = stub.executed();
    assert!(!log.is_empty());
    assert!(log.iter().all(|c| c.starts_with("iptables ")));
}

#[test]
fn test_ipv6_disabled_ignores_bad_v6_probe() {
    let stub = StubExecutor::new();
    let cfg = Configurator::new(test_config(false), &stub, EmptyNetlink).unwrap();
    assert!(
        cfg.create_inpod_rules(PROBE_V4, Some(Ipv6Addr::LOCALHOST), false)
            .is_ok()
    );
}

#[test]
fn test_ipv6_enabled_requires_v6_probe() {
    let stub = StubExecutor::new();
    let cfg = Configurator::new(test_config(true), &stub, EmptyNetlink).unwrap();
    let err = cfg.create_inpod_rules(PROBE_V4, None, false).unwrap_err();
    assert!(matches!(err, Error::Config { field, .. } if field == "probe_v6"));
    assert!(stub.executed().is_empty());
}

#[test]
fn test_invalid_probe_mutates_nothing() {
    let stub = StubExecutor::new();
    let cfg = Configurator::new(test_config(true), &stub, EmptyNetlink).unwrap();

    // IPv4 is fine, IPv6 is not: nothing runs, not even the IPv4 plan
    let err = cfg
        .create_inpod_rules(PROBE_V4, Some(Ipv6Addr::UNSPECIFIED), false)
        .unwrap_err();
    assert!(matches!(err, Error::Config { field, .. } if field == "probe_v6"));

    let err = cfg
        .create_host_rules_for_health_checks(Some(Ipv4Addr::BROADCAST), None)
        .unwrap_err();
    assert!(matches!(err, Error::Config { field, .. } if field == "probe_v4"));
    assert!(stub.executed().is_empty());
}

#[test]
fn test_invalid_config_rejected_at_construction() {
    let config = Config {
        outbound_port: 15006,
        ..Config::default()
    };
    let result = Configurator::new(config, StubExecutor::new(), EmptyNetlink);
    assert!(matches!(result, Err(Error::Config { .. })));
}

// ═══════════════════════════════════════════════════════════════════════════
// Modes
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_ingress_log_is_subsequence_of_default() {
    let run = |ingress_mode| {
        let stub = StubExecutor::new();
        let cfg = Configurator::new(test_config(true), &stub, EmptyNetlink).unwrap();
        cfg.create_inpod_rules(PROBE_V4, Some(PROBE_V6), ingress_mode)
            .unwrap();
        stub.executed()
    };
    let default = run(false);
    let ingress = run(true);

    assert!(ingress.len() < default.len());
    let mut rest = default.iter();
    for line in &ingress {
        assert!(rest.any(|d| d == line), "{line} missing or out of order");
    }
    assert!(!ingress.iter().any(|l| l.contains("--to-ports 15001")));
    assert!(!ingress.iter().any(|l| l.contains("--dport 53")));
    assert!(!ingress.iter().any(|l| l.contains("-I OUTPUT -j MESH_OUTPUT") && l.contains(" nat ")));
}

#[test]
fn test_switch_to_ingress_clears_outbound_capture() {
    let fake = FakeNetfilter::new();
    let netlink = FakeNetlink::new();
    let cfg = Configurator::new(test_config(false), &fake, &netlink).unwrap();

    cfg.create_inpod_rules(PROBE_V4, None, false).unwrap();
    assert!(!fake.rules("iptables", "nat", "MESH_OUTPUT").is_empty());
    assert!(!fake.rules("iptables", "raw", "MESH_PRERT").is_empty());

    cfg.create_inpod_rules(PROBE_V4, None, true).unwrap();
    assert!(fake.rules("iptables", "nat", "MESH_OUTPUT").is_empty());
    assert!(fake.rules("iptables", "raw", "MESH_PRERT").is_empty());
    assert!(fake.rules("iptables", "raw", "MESH_OUTPUT").is_empty());
    assert_eq!(fake.rules("iptables", "mangle", "MESH_PRERT").len(), 6);
}

// ═══════════════════════════════════════════════════════════════════════════
// Idempotency against kernel-like state
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_second_run_leaves_identical_state() {
    let fake = FakeNetfilter::new();
    let netlink = FakeNetlink::new();
    let cfg = Configurator::new(test_config(true), &fake, &netlink).unwrap();

    cfg.create_inpod_rules(PROBE_V4, Some(PROBE_V6), false).unwrap();
    let first = fake.snapshot();
    fake.clear_log();

    cfg.create_inpod_rules(PROBE_V4, Some(PROBE_V6), false).unwrap();
    assert_eq!(fake.snapshot(), first);

    // Jumps were found by listing, not inserted again
    assert!(!fake.executed().iter().any(|c| c.contains(" -I ")));

    for binary in ["iptables", "ip6tables"] {
        for (table, builtin, mesh) in INPOD_JUMPS {
            assert_eq!(
                jump_count(&fake, binary, table.as_ref(), builtin, mesh),
                1,
                "{binary} {table} {builtin}"
            );
        }
    }
    assert_eq!(netlink.rule_count(), 2);
    assert_eq!(netlink.route_count(), 2);
}

#[test]
fn test_host_rules_idempotent_and_separate() {
    let fake = FakeNetfilter::new();
    let cfg = Configurator::new(test_config(true), &fake, EmptyNetlink).unwrap();

    cfg.create_host_rules_for_health_checks(Some(PROBE_V4), Some(HOST_PROBE_V6))
        .unwrap();
    cfg.create_host_rules_for_health_checks(Some(PROBE_V4), Some(HOST_PROBE_V6))
        .unwrap();

    assert_eq!(fake.rules("iptables", "nat", "MESH_POSTRT").len(), 1);
    assert_eq!(fake.rules("ip6tables", "nat", "MESH_POSTRT").len(), 1);
    assert_eq!(jump_count(&fake, "iptables", "nat", "POSTROUTING", "MESH_POSTRT"), 1);
    assert_eq!(
        fake.user_chains("iptables"),
        vec![("nat".to_string(), "MESH_POSTRT".to_string())]
    );
}

#[test]
fn test_teardown_leaves_clean_state() {
    let fake = FakeNetfilter::new();
    let netlink = FakeNetlink::new();
    let cfg = Configurator::new(test_config(true), &fake, &netlink).unwrap();

    cfg.create_inpod_rules(PROBE_V4, Some(PROBE_V6), false).unwrap();
    cfg.create_host_rules_for_health_checks(Some(PROBE_V4), Some(HOST_PROBE_V6))
        .unwrap();

    cfg.delete_inpod_rules().unwrap();
    cfg.delete_host_rules().unwrap();
    assert!(fake.snapshot().is_empty(), "{:?}", fake.snapshot());
    assert_eq!(netlink.rule_count(), 0);
    assert_eq!(netlink.route_count(), 0);

    // Nothing left to remove is not an error
    cfg.delete_inpod_rules().unwrap();
    cfg.delete_host_rules().unwrap();
}

#[test]
fn test_teardown_after_ingress_install() {
    let fake = FakeNetfilter::new();
    let cfg = Configurator::new(test_config(false), &fake, EmptyNetlink).unwrap();
    cfg.create_inpod_rules(PROBE_V4, None, true).unwrap();
    cfg.delete_inpod_rules().unwrap();
    assert!(fake.snapshot().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// Failure handling
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_failure_stops_everything_after_it() {
    let stub = StubExecutor::new().with_failure(
        "iptables -t raw -N",
        3,
        "iptables v1.8.9 (legacy): can't initialize iptables table `raw': Permission denied",
    );
    let cfg = Configurator::new(test_config(true), &stub, EmptyNetlink).unwrap();
    let err = cfg
        .create_inpod_rules(PROBE_V4, Some(PROBE_V6), false)
        .unwrap_err();

    let log = stub.executed();
    assert_eq!(log.last().map(String::as_str), Some("iptables -t raw -N MESH_PRERT"));
    assert!(!log.iter().any(|c| c.starts_with("ip6tables")));
    match err {
        Error::Execution {
            family,
            attempted,
            journal,
            ..
        } => {
            assert_eq!(family, IpFamily::V4);
            assert_eq!(attempted, log.len());
            assert_eq!(journal, log);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_missing_loopback_is_netlink_error() {
    let fake = FakeNetfilter::new();
    let netlink = FakeNetlink::without_link("lo");
    let cfg = Configurator::new(test_config(false), &fake, &netlink).unwrap();
    let err = cfg.create_inpod_rules(PROBE_V4, None, false).unwrap_err();
    assert!(matches!(err, Error::Netlink { family: IpFamily::V4, .. }));
    assert!(fake.executed().is_empty());
    assert!(fake.snapshot().is_empty());
    assert_eq!(netlink.rule_count(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// Planning
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_plans_predict_the_command_log() {
    let stub = StubExecutor::new();
    let cfg = Configurator::new(test_config(true), &stub, EmptyNetlink).unwrap();

    let plans = cfg.plan_inpod(PROBE_V4, Some(PROBE_V6), false).unwrap();
    assert_eq!(plans.len(), 2);
    let predicted: Vec<String> = plans.iter().flat_map(|p| p.commands()).collect();
    assert!(stub.executed().is_empty());

    cfg.create_inpod_rules(PROBE_V4, Some(PROBE_V6), false).unwrap();
    assert_eq!(stub.executed(), predicted);
}

#[test]
fn test_plan_fingerprint_stable_across_runs() {
    let cfg = Configurator::new(test_config(false), StubExecutor::new(), EmptyNetlink).unwrap();
    let a = cfg.plan_inpod(PROBE_V4, None, false).unwrap();
    let b = cfg.plan_inpod(PROBE_V4, None, false).unwrap();
    let c = cfg.plan_inpod(PROBE_V4, None, true).unwrap();
    assert_eq!(a[0].fingerprint(), b[0].fingerprint());
    assert_ne!(a[0].fingerprint(), c[0].fingerprint());
}

#[test]
fn test_host_plan_skips_absent_families() {
    let cfg = Configurator::new(test_config(true), StubExecutor::new(), EmptyNetlink).unwrap();
    let plans = cfg.plan_host(None, Some(HOST_PROBE_V6)).unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].family, IpFamily::V6);
    assert!(
        plans[0]
            .steps
            .iter()
            .all(|s| s.op().table == Table::Nat && s.op().action != Action::Delete)
    );
    assert!(cfg.plan_host(None, None).unwrap().is_empty());
}

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_config() -> impl Strategy<Value = Config> {
        (any::<bool>(), any::<bool>(), 1024u16..60000, 1u32..250).prop_map(
            |(redirect_dns, enable_ipv6, base, table)| Config {
                redirect_dns,
                enable_ipv6,
                inbound_port: base,
                inbound_tunnel_port: base + 1,
                outbound_port: base + 2,
                dns_port: base + 3,
                route_table: table,
                ..Config::default()
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_any_config_orders_and_guards(config in arb_config(), ingress in any::<bool>()) {
            for family in [IpFamily::V4, IpFamily::V6] {
                let ops = inpod_rules(&config, family, probe_for(family), ingress);
                if family == IpFamily::V6 && !config.enable_ipv6 {
                    prop_assert!(ops.is_empty());
                    continue;
                }
                assert_chain_order(&ops);
                prop_assert!(guard(family, ops, Intent::Install).is_ok());
            }
        }

        #[test]
        fn test_any_config_converges(config in arb_config(), ingress in any::<bool>()) {
            let fake = FakeNetfilter::new();
            let netlink = FakeNetlink::new();
            let cfg = Configurator::new(config, &fake, &netlink).unwrap();

            cfg.create_inpod_rules(PROBE_V4, Some(PROBE_V6), ingress).unwrap();
            let first = fake.snapshot();
            cfg.create_inpod_rules(PROBE_V4, Some(PROBE_V6), ingress).unwrap();
            prop_assert_eq!(fake.snapshot(), first);

            cfg.delete_inpod_rules().unwrap();
            prop_assert!(fake.snapshot().is_empty());
        }
    }
}
