//! Input validation for configuration values and probe addresses
//!
//! Every value that ends up on an iptables or iproute2 command line passes
//! through one of these functions first. Validators return the accepted value
//! so call sites can chain them with `?`.

use crate::core::rules::Mark;
use std::net::IpAddr;

/// Kernel routing tables that must never be used for TPROXY delivery
/// (`default`, `main`, `local`).
pub const RESERVED_ROUTE_TABLES: [u32; 3] = [253, 254, 255];

/// Maximum ipset name length (`IPSET_MAXNAMELEN - 1`)
pub const MAX_IPSET_NAME_LEN: usize = 31;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates that no two named proxy ports collide.
///
/// # Errors
///
/// Returns `Err` naming the first pair of fields that share a port.
pub fn validate_distinct_ports(ports: &[(&str, u16)]) -> Result<(), String> {
    for (i, (name_a, a)) in ports.iter().enumerate() {
        for (name_b, b) in &ports[i + 1..] {
            if a == b {
                return Err(format!("{name_a} and {name_b} both use port {a}"));
            }
        }
    }
    Ok(())
}

/// Validates a probe source address.
///
/// The address is matched as a packet source inside the pod and written as an
/// SNAT source on the host, so it has to be a usable unicast address.
///
/// # Errors
///
/// Returns `Err` for unspecified, loopback, multicast, or IPv4 broadcast addresses.
///
/// # Examples
///
/// ```
/// use meshfw::validators::validate_probe_address;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let probe = IpAddr::V4(Ipv4Addr::new(169, 254, 7, 127));
/// assert_eq!(validate_probe_address(probe), Ok(probe));
/// assert!(validate_probe_address(IpAddr::V4(Ipv4Addr::LOCALHOST)).is_err());
/// ```
pub fn validate_probe_address(addr: IpAddr) -> Result<IpAddr, String> {
    if addr.is_unspecified() {
        return Err(format!("{addr} is the unspecified address"));
    }
    if addr.is_loopback() {
        return Err(format!("{addr} is a loopback address"));
    }
    if addr.is_multicast() {
        return Err(format!("{addr} is a multicast address"));
    }
    if let IpAddr::V4(v4) = addr
        && v4.is_broadcast()
    {
        return Err(format!("{addr} is the broadcast address"));
    }
    Ok(addr)
}

/// Validates an ipset name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than 31 characters, or contains
/// anything outside `[A-Za-z0-9_.-]`.
pub fn validate_ipset_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("ipset name cannot be empty".to_string());
    }

    if name.len() > MAX_IPSET_NAME_LEN {
        return Err(format!(
            "ipset name too long (max {MAX_IPSET_NAME_LEN} characters)"
        ));
    }

    // ASCII only; the name is passed verbatim to the set match
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("ipset name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a firewall mark/mask pair.
///
/// # Errors
///
/// Returns `Err` if the value or mask is zero, or the value has bits outside the mask.
pub fn validate_mark(mark: Mark) -> Result<Mark, String> {
    if mark.mask == 0 {
        return Err("Mark mask must be non-zero".to_string());
    }
    if mark.value == 0 {
        return Err("Mark value must be non-zero".to_string());
    }
    if mark.value & !mark.mask != 0 {
        return Err(format!(
            "Mark value {:#x} has bits outside mask {:#x}",
            mark.value, mark.mask
        ));
    }
    Ok(mark)
}

/// Validates a policy routing table id.
///
/// # Errors
///
/// Returns `Err` for table 0 and the reserved kernel tables.
pub fn validate_route_table(table: u32) -> Result<u32, String> {
    if table == 0 {
        return Err("Route table must be non-zero".to_string());
    }
    if RESERVED_ROUTE_TABLES.contains(&table) {
        return Err(format!("Route table {table} is reserved by the kernel"));
    }
    Ok(table)
}
