use crate::core::error::{Error, Result};
use crate::core::guard::{GuardedPlan, Step};
use crate::core::rules::IpFamily;
use crate::exec::{CommandError, CommandExecutor, CommandOutput, render_command};
use tracing::{debug, error, info};

/// Runs guarded plans for one family, journaling every command.
///
/// Commands run strictly in plan order. The first failure stops the plan;
/// everything before it has already taken effect, and re-applying the same
/// plan is the way to finish the job.
pub struct Applier<'a, E> {
    executor: &'a E,
    family: IpFamily,
    journal: Vec<String>,
}

impl<'a, E: CommandExecutor> Applier<'a, E> {
    pub fn new(executor: &'a E, family: IpFamily) -> Self {
        Self {
            executor,
            family,
            journal: Vec::new(),
        }
    }

    /// Commands attempted so far, the failing one included
    pub fn journal(&self) -> &[String] {
        &self.journal
    }

    /// Applies every step of `plan`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`] for the first command that fails outside
    /// the tolerated idempotency cases, or [`Error::Internal`] if the plan was
    /// built for another family.
    pub fn apply(&mut self, plan: &GuardedPlan) -> Result<()> {
        if plan.family != self.family {
            return Err(Error::Internal(format!(
                "{} plan handed to {} applier",
                plan.family, self.family
            )));
        }

        info!(
            "Applying {} {} plan ({} steps, fingerprint {})",
            self.family,
            plan.intent,
            plan.steps.len(),
            &plan.fingerprint()[..12]
        );

        for step in &plan.steps {
            self.apply_step(step)?;
        }

        debug!("{} plan complete after {} commands", self.family, self.journal.len());
        Ok(())
    }

    fn apply_step(&mut self, step: &Step) -> Result<()> {
        let op = step.op();
        let args = op.args();

        match step {
            Step::CreateChain(_) => match self.run(&args) {
                Ok(_) => Ok(()),
                Err(e) if e.is_already_exists() => {
                    debug!("Reusing existing chain {} {}", op.table, op.chain);
                    Ok(())
                }
                Err(e) => Err(self.failure(&args, &e)),
            },
            Step::Exec(_) => self.run(&args).map(|_| ()).map_err(|e| self.failure(&args, &e)),
            Step::EnsureRule(_) => {
                let list_args = op.list_args();
                let listing = self
                    .run(&list_args)
                    .map_err(|e| self.failure(&list_args, &e))?;
                let wanted = op.saved_form();
                if listing.stdout.lines().any(|line| line.trim() == wanted) {
                    debug!("Rule already present in {} {}: {wanted}", op.table, op.chain);
                    return Ok(());
                }
                self.run(&args).map(|_| ()).map_err(|e| self.failure(&args, &e))
            }
            Step::Remove(_) => match self.run(&args) {
                Ok(_) => Ok(()),
                Err(e) if e.is_missing() => {
                    debug!("Nothing to remove for `{}`", args.join(" "));
                    Ok(())
                }
                Err(e) => Err(self.failure(&args, &e)),
            },
        }
    }

    fn run(&mut self, args: &[String]) -> std::result::Result<CommandOutput, CommandError> {
        let binary = self.family.iptables_binary();
        let command = render_command(binary, args);
        debug!("{command}");
        self.journal.push(command);
        self.executor.run(binary, args)
    }

    fn failure(&self, args: &[String], err: &CommandError) -> Error {
        let command = render_command(self.family.iptables_binary(), args);
        error!("{command} failed: {err}");
        Error::Execution {
            family: self.family,
            command,
            message: err.to_string(),
            stderr: err.stderr().map(str::to_string),
            exit_code: err.exit_code(),
            attempted: self.journal.len(),
            journal: self.journal.clone(),
        }
    }
}
