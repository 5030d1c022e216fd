//! Entry points for configuring a pod namespace and the host
//!
//! A [`Configurator`] owns a validated [`Config`], the command executor for
//! the target namespace and a netlink handle for the same namespace. Every
//! entry point:
//!
//! 1. Validates its inputs (probe addresses)
//! 2. Builds and guards the plans for all families
//! 3. Checks the namespace has a loopback link (in-pod only)
//! 4. Applies them family by family, IPv4 first
//!
//! Steps 1 to 3 cannot mutate anything, so configuration and invariant errors
//! never leave partial state. A failure in step 4 does; calling the same entry
//! point again converges.

use crate::config::Config;
use crate::core::apply::Applier;
use crate::core::builder;
use crate::core::error::{Error, Result};
use crate::core::guard::{GuardedPlan, Intent, guard};
use crate::core::rules::{IpFamily, LOOPBACK_INTERFACE};
use crate::exec::CommandExecutor;
use crate::netlink::{NetlinkError, NetlinkHandle, PolicyRule, Route};
use crate::validators::validate_probe_address;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, info, warn};

pub struct Configurator<E, N> {
    config: Config,
    executor: E,
    netlink: N,
}

impl<E: CommandExecutor, N: NetlinkHandle> Configurator<E, N> {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not validate.
    pub fn new(config: Config, executor: E, netlink: N) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            executor,
            netlink,
        })
    }

    /// Families this configurator ever touches
    pub fn families(&self) -> Vec<IpFamily> {
        [IpFamily::V4, IpFamily::V6]
            .into_iter()
            .filter(|f| builder::family_enabled(&self.config, *f))
            .collect()
    }

    /// Builds the guarded in-pod plans without running anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid probe address or a missing
    /// IPv6 probe address while IPv6 is enabled, and [`Error::Internal`] if
    /// a plan fails its guard checks.
    pub fn plan_inpod(
        &self,
        probe_v4: Ipv4Addr,
        probe_v6: Option<Ipv6Addr>,
        ingress_mode: bool,
    ) -> Result<Vec<GuardedPlan>> {
        let mut probes = vec![(IpFamily::V4, checked_probe("probe_v4", probe_v4.into())?)];
        match probe_v6 {
            Some(v6) if self.config.enable_ipv6 => {
                probes.push((IpFamily::V6, checked_probe("probe_v6", v6.into())?));
            }
            None if self.config.enable_ipv6 => {
                return Err(Error::config(
                    "probe_v6",
                    "an IPv6 probe address is required when enable_ipv6 is set",
                ));
            }
            Some(_) => debug!("IPv6 disabled, ignoring IPv6 probe address"),
            None => {}
        }

        probes
            .into_iter()
            .map(|(family, probe)| {
                let ops = builder::inpod_rules(&self.config, family, probe, ingress_mode);
                guard(family, ops, Intent::Install)
            })
            .collect()
    }

    /// Builds the guarded host probe plans without running anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid probe address.
    pub fn plan_host(
        &self,
        probe_v4: Option<Ipv4Addr>,
        probe_v6: Option<Ipv6Addr>,
    ) -> Result<Vec<GuardedPlan>> {
        let mut probes = Vec::with_capacity(2);
        if let Some(v4) = probe_v4 {
            probes.push((IpFamily::V4, checked_probe("probe_v4", v4.into())?));
        } else {
            info!("No IPv4 probe address, skipping IPv4 host rules");
        }
        match probe_v6 {
            Some(v6) if self.config.enable_ipv6 => {
                probes.push((IpFamily::V6, checked_probe("probe_v6", v6.into())?));
            }
            Some(_) => debug!("IPv6 disabled, ignoring IPv6 probe address"),
            None if self.config.enable_ipv6 => {
                warn!("IPv6 enabled but no IPv6 probe address, skipping IPv6 host rules");
            }
            None => {}
        }

        probes
            .into_iter()
            .map(|(family, probe)| {
                guard(
                    family,
                    builder::host_rules(&self.config, family, probe),
                    Intent::Install,
                )
            })
            .collect()
    }

    /// Configures traffic capture in the pod namespace.
    ///
    /// In ingress mode only inbound traffic is captured; outbound capture and
    /// DNS redirection are left out.
    ///
    /// # Errors
    ///
    /// See [`plan_inpod`](Self::plan_inpod) for errors raised before anything
    /// runs. Afterwards, returns [`Error::Execution`] for the first failed
    /// command or [`Error::Netlink`] if policy routing cannot be installed.
    pub fn create_inpod_rules(
        &self,
        probe_v4: Ipv4Addr,
        probe_v6: Option<Ipv6Addr>,
        ingress_mode: bool,
    ) -> Result<()> {
        let plans = self.plan_inpod(probe_v4, probe_v6, ingress_mode)?;
        self.check_loopback()?;
        info!(
            "Configuring in-pod capture ({} families, ingress_mode={ingress_mode}, redirect_dns={})",
            plans.len(),
            self.config.redirect_dns
        );

        for plan in &plans {
            Applier::new(&self.executor, plan.family).apply(plan)?;
            self.add_policy_routing(plan.family)?;
        }
        Ok(())
    }

    /// Configures SNAT of node health probes in the host namespace.
    ///
    /// Either address may be absent to skip that family.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid probe address, otherwise
    /// [`Error::Execution`] for the first failed command.
    pub fn create_host_rules_for_health_checks(
        &self,
        probe_v4: Option<Ipv4Addr>,
        probe_v6: Option<Ipv6Addr>,
    ) -> Result<()> {
        let plans = self.plan_host(probe_v4, probe_v6)?;
        if plans.is_empty() {
            warn!("No probe addresses supplied, host rules left untouched");
            return Ok(());
        }

        for plan in &plans {
            Applier::new(&self.executor, plan.family).apply(plan)?;
        }
        Ok(())
    }

    /// Removes in-pod capture and its policy routing. Absent state is fine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`] or [`Error::Netlink`] for failures other
    /// than missing rules, chains or routes.
    pub fn delete_inpod_rules(&self) -> Result<()> {
        for family in self.families() {
            let plan = guard(
                family,
                builder::inpod_teardown(&self.config, family),
                Intent::Remove,
            )?;
            Applier::new(&self.executor, family).apply(&plan)?;
            self.remove_policy_routing(family)?;
        }
        info!("Removed in-pod capture");
        Ok(())
    }

    /// Removes the host probe rules. Absent state is fine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`] for failures other than missing rules or chains.
    pub fn delete_host_rules(&self) -> Result<()> {
        for family in self.families() {
            let plan = guard(
                family,
                builder::host_teardown(&self.config, family),
                Intent::Remove,
            )?;
            Applier::new(&self.executor, family).apply(&plan)?;
        }
        info!("Removed host probe rules");
        Ok(())
    }

    fn policy_rule(&self, family: IpFamily) -> PolicyRule {
        PolicyRule {
            family,
            priority: self.config.rule_priority,
            mark: self.config.tproxy_mark,
            table: self.config.route_table,
        }
    }

    /// The local routes hang off `lo`; without it nothing may be applied
    fn check_loopback(&self) -> Result<()> {
        let netlink_err = |source| Error::Netlink {
            family: IpFamily::V4,
            source,
        };
        if self
            .netlink
            .link_exists(LOOPBACK_INTERFACE)
            .map_err(netlink_err)?
        {
            Ok(())
        } else {
            Err(netlink_err(NetlinkError::NotFound))
        }
    }

    /// fwmark rule plus local default route so TPROXY'd packets reach the proxy
    fn add_policy_routing(&self, family: IpFamily) -> Result<()> {
        let netlink_err = |source| Error::Netlink { family, source };

        let rule = self.policy_rule(family);
        let route = Route::local_default(family, self.config.route_table).map_err(netlink_err)?;

        match self.netlink.add_rule(&rule) {
            Ok(()) => {}
            Err(NetlinkError::Exists) => debug!("{family} fwmark rule already present"),
            Err(e) => return Err(netlink_err(e)),
        }
        match self.netlink.add_route(&route) {
            Ok(()) => {}
            Err(NetlinkError::Exists) => debug!("{family} route {route} already present"),
            Err(e) => return Err(netlink_err(e)),
        }
        Ok(())
    }

    fn remove_policy_routing(&self, family: IpFamily) -> Result<()> {
        let netlink_err = |source| Error::Netlink { family, source };
        let route = Route::local_default(family, self.config.route_table).map_err(netlink_err)?;

        match self.netlink.del_rule(&self.policy_rule(family)) {
            Ok(()) | Err(NetlinkError::NotFound) => {}
            Err(e) => return Err(netlink_err(e)),
        }
        match self.netlink.del_route(&route) {
            Ok(()) | Err(NetlinkError::NotFound) => {}
            Err(e) => return Err(netlink_err(e)),
        }
        Ok(())
    }
}

fn checked_probe(field: &str, addr: IpAddr) -> Result<IpAddr> {
    validate_probe_address(addr).map_err(|e| Error::config(field, e))
}
