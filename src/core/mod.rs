//! Core capture rule functionality
//!
//! This module contains the rule model and the pipeline that turns a
//! configuration into kernel state:
//!
//! - [`rules`]: Operation records and iptables argument rendering
//! - [`builder`]: Pure per-family rule builders (in-pod, host, teardown)
//! - [`guard`]: Idempotency checks and guarded plans
//! - [`apply`]: Sequential plan execution with a command journal
//! - [`configurator`]: Public entry points
//! - [`error`]: Error types and user-facing translations

pub mod apply;
pub mod builder;
pub mod configurator;
pub mod error;
pub mod guard;
pub mod rules;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
