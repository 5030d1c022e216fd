//! Idempotency guard
//!
//! Turns a builder's raw operations into a [`GuardedPlan`] whose steps can be
//! run any number of times against the same namespace and leave the same
//! rule set:
//!
//! - `-N` becomes [`Step::CreateChain`]; an existing chain is reused
//! - `-F` and `-A` run as-is, but only on mesh chains the plan itself reset
//! - `-I` into a built-in chain becomes [`Step::EnsureRule`]: list, then insert
//!   only when the identical rule is missing
//! - removal ops become [`Step::Remove`]; absent state is fine
//!
//! The plan is checked before anything runs. A violation is a builder bug and
//! is reported as [`Error::Internal`] without touching the kernel.

use crate::core::error::{Error, Result};
use crate::core::rules::{Action, IpFamily, RuleOp, Stage, Table, Target, is_mesh_chain};
use crate::exec::render_command;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// What the plan is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Intent {
    Install,
    Remove,
}

/// One guarded unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Step {
    /// `-N`; "chain already exists" counts as success
    CreateChain(RuleOp),
    /// Runs unconditionally
    Exec(RuleOp),
    /// `-S <chain>` first; `-I` only if the rule is not listed
    EnsureRule(RuleOp),
    /// `-D`/`-F`/`-X`; a missing rule or chain counts as success
    Remove(RuleOp),
}

impl Step {
    pub fn op(&self) -> &RuleOp {
        match self {
            Step::CreateChain(op) | Step::Exec(op) | Step::EnsureRule(op) | Step::Remove(op) => op,
        }
    }
}

/// Ordered, checked steps for one family
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardedPlan {
    pub family: IpFamily,
    pub intent: Intent,
    pub steps: Vec<Step>,
}

impl GuardedPlan {
    /// Every command the plan may issue, in order.
    ///
    /// Against a namespace without the rules in place this is exactly the
    /// command log of one application.
    pub fn commands(&self) -> Vec<String> {
        let binary = self.family.iptables_binary();
        let mut commands = Vec::with_capacity(self.steps.len() + 8);
        for step in &self.steps {
            if let Step::EnsureRule(op) = step {
                commands.push(render_command(binary, &op.list_args()));
            }
            commands.push(render_command(binary, &step.op().args()));
        }
        commands
    }

    /// SHA-256 (hex) of [`commands`](Self::commands), for correlating logs
    /// across nodes and runs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for command in self.commands() {
            hasher.update(command.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Checks `ops` and wraps each in the step that makes it safe to repeat.
///
/// # Errors
///
/// Returns [`Error::Internal`] if an operation would write into a chain the
/// plan did not reset, touch a chain the crate does not own, or break the
/// stage order within a chain.
pub fn guard(family: IpFamily, ops: Vec<RuleOp>, intent: Intent) -> Result<GuardedPlan> {
    let steps = match intent {
        Intent::Install => guard_install(ops)?,
        Intent::Remove => guard_remove(ops)?,
    };
    Ok(GuardedPlan {
        family,
        intent,
        steps,
    })
}

fn violation(op: &RuleOp, what: &str) -> Error {
    Error::Internal(format!(
        "{what}: `{}` ({} stage)",
        op.args().join(" "),
        op.stage
    ))
}

fn guard_install(ops: Vec<RuleOp>) -> Result<Vec<Step>> {
    let mut created: HashSet<(Table, &'static str)> = HashSet::new();
    let mut reset: HashSet<(Table, &'static str)> = HashSet::new();
    let mut last_stage: HashMap<(Table, &'static str), Stage> = HashMap::new();
    let mut steps = Vec::with_capacity(ops.len());

    for op in ops {
        let key = (op.table, op.chain);

        if let Some(prev) = last_stage.get(&key)
            && op.stage < *prev
        {
            return Err(violation(&op, "stage order regresses within chain"));
        }
        last_stage.insert(key, op.stage);

        let step = match op.action {
            Action::NewChain => {
                if !is_mesh_chain(op.chain) {
                    return Err(violation(&op, "refusing to create a foreign chain"));
                }
                created.insert(key);
                Step::CreateChain(op)
            }
            Action::Flush => {
                if !created.contains(&key) {
                    return Err(violation(&op, "flush of a chain not created by this plan"));
                }
                reset.insert(key);
                Step::Exec(op)
            }
            Action::Append => {
                if !reset.contains(&key) {
                    return Err(violation(&op, "append into a chain this plan did not reset"));
                }
                Step::Exec(op)
            }
            Action::Insert => {
                if is_mesh_chain(op.chain) {
                    return Err(violation(&op, "insert into a mesh chain"));
                }
                match &op.target {
                    Some(Target::Jump(mesh)) if reset.contains(&(op.table, *mesh)) => {}
                    _ => return Err(violation(&op, "built-in insert must jump to a reset mesh chain")),
                }
                Step::EnsureRule(op)
            }
            Action::Delete | Action::DeleteChain => {
                return Err(violation(&op, "removal in an install plan"));
            }
        };
        steps.push(step);
    }

    Ok(steps)
}

fn guard_remove(ops: Vec<RuleOp>) -> Result<Vec<Step>> {
    ops.into_iter()
        .map(|op| match op.action {
            Action::Delete => Ok(Step::Remove(op)),
            Action::Flush | Action::DeleteChain if is_mesh_chain(op.chain) => Ok(Step::Remove(op)),
            Action::Flush | Action::DeleteChain => {
                Err(violation(&op, "refusing to remove a foreign chain"))
            }
            Action::NewChain | Action::Append | Action::Insert => {
                Err(violation(&op, "addition in a remove plan"))
            }
        })
        .collect()
}
