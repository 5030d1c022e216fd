//! meshfw - in-pod traffic capture for a node-level mesh agent
//!
//! Computes and applies the netfilter rule set that transparently redirects a
//! pod's traffic into a mesh proxy, from outside the pod's network namespace.
//!
//! # Architecture
//!
//! - [`core`] - Rule building, idempotency guard, applier and entry points
//! - [`exec`] - Command execution (system, namespaced, stub)
//! - [`netlink`] - Policy routing for TPROXY delivery
//! - [`config`] - Configuration model and file loading
//! - [`validators`] - Input validation
//!
//! # Guarantees
//!
//! - Inputs and plans are checked before the first command runs
//! - Mesh chains are reset before any rule is appended to them
//! - Jumps from built-in chains are inserted only when missing
//! - IPv6 tooling is never invoked while IPv6 is disabled
//! - Exemptions precede captures in every chain
//!
//! # Example
//!
//! ```
//! use meshfw::{Config, Configurator};
//! use meshfw::exec::StubExecutor;
//! use meshfw::netlink::EmptyNetlink;
//! use std::net::Ipv4Addr;
//!
//! let stub = StubExecutor::new();
//! let configurator = Configurator::new(Config::default(), &stub, EmptyNetlink).unwrap();
//! configurator
//!     .create_inpod_rules(Ipv4Addr::new(169, 254, 7, 127), None, false)
//!     .unwrap();
//! assert_eq!(stub.executed()[0], "iptables -t mangle -N MESH_PRERT");
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod exec;
pub mod netlink;
pub mod validators;

// Re-export commonly used types
pub use config::Config;
pub use core::configurator::Configurator;
pub use core::error::{Error, Result};
