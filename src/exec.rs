//! Command execution for netfilter and iproute2 tools
//!
//! Everything meshfw does to the kernel goes through a [`CommandExecutor`].
//! Two implementations ship with the crate:
//!
//! - [`SystemExecutor`]: runs the program, optionally inside a network
//!   namespace via `nsenter --net=<path>`
//! - [`StubExecutor`]: records every invocation and touches nothing; used by
//!   tests and `--dry-run`
//!
//! # Security
//!
//! - Arguments are passed directly without shell interpretation
//! - Binaries are checked for availability before spawning
//!
//! # Example
//!
//! ```
//! use meshfw::exec::{CommandExecutor, StubExecutor};
//!
//! let stub = StubExecutor::new();
//! stub.run("iptables", &["-t".into(), "nat".into(), "-N".into(), "MESH_OUTPUT".into()])
//!     .unwrap();
//! assert_eq!(stub.executed(), vec!["iptables -t nat -N MESH_OUTPUT"]);
//! ```

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Error type for command execution
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Binary not found in PATH
    #[error("{0} not found in PATH")]
    NotFound(String),

    /// Process could not be started
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Process ran and exited unsuccessfully
    #[error("{}: {}", exit_description(.exit_code), .stderr.trim())]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// `nsenter` itself failed, so the wrapped program never ran
    #[error("cannot enter network namespace {}: {}", .netns.display(), .message.trim())]
    Namespace { netns: PathBuf, message: String },
}

#[allow(clippy::ref_option)]
fn exit_description(code: &Option<i32>) -> String {
    code.map_or_else(
        || "killed by signal".to_string(),
        |c| format!("exit status {c}"),
    )
}

impl CommandError {
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        CommandError::Failed {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Failed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn stderr(&self) -> Option<&str> {
        match self {
            CommandError::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// `-N` on a chain, or `ip ... add` of an entry, that is already there
    pub fn is_already_exists(&self) -> bool {
        self.stderr().is_some_and(|s| {
            let lower = s.to_lowercase();
            lower.contains("chain already exists") || lower.contains("rtnetlink answers: file exists")
        })
    }

    /// `-D`/`-F`/`-X`, or `ip ... del`, on something that is not there.
    ///
    /// Only netfilter and RTNETLINK phrasings count; a bare "No such file or
    /// directory" can just as well mean the tool or namespace is missing.
    pub fn is_missing(&self) -> bool {
        self.stderr().is_some_and(|s| {
            let lower = s.to_lowercase();
            lower.contains("no chain/target/match by that name")
                || lower.contains("does a matching rule exist")
                || lower.contains("couldn't load target")
                || lower.contains("rtnetlink answers: no such file or directory")
                || lower.contains("rtnetlink answers: no such process")
        })
    }
}

/// Runs a named program with arguments and captures its output.
///
/// Implementations must not interpret arguments through a shell.
pub trait CommandExecutor {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError>;
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for &T {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        (**self).run(program, args)
    }
}

/// Renders a command the way the command log records it
pub fn render_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Executes commands on the local system, optionally inside a network namespace
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor {
    netns: Option<PathBuf>,
}

impl SystemExecutor {
    /// Runs commands in the caller's own namespace
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every command inside the namespace at `path` (e.g. `/proc/<pid>/ns/net`)
    pub fn in_netns(path: impl Into<PathBuf>) -> Self {
        Self {
            netns: Some(path.into()),
        }
    }

    pub fn netns(&self) -> Option<&Path> {
        self.netns.as_deref()
    }

    fn failure(&self, exit_code: Option<i32>, stderr: String) -> CommandError {
        match &self.netns {
            Some(netns) if stderr.trim_start().starts_with("nsenter:") => CommandError::Namespace {
                netns: netns.clone(),
                message: stderr,
            },
            _ => CommandError::Failed { exit_code, stderr },
        }
    }

    fn build_command(&self, program: &str, args: &[String]) -> Result<Command, CommandError> {
        if let Some(netns) = &self.netns {
            if !binary_exists("nsenter") {
                return Err(CommandError::NotFound("nsenter".into()));
            }
            let mut cmd = Command::new("nsenter");
            cmd.arg(format!("--net={}", netns.display()))
                .arg("--")
                .arg(program)
                .args(args);
            return Ok(cmd);
        }

        if !binary_exists(program) {
            return Err(CommandError::NotFound(program.to_string()));
        }
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl CommandExecutor for SystemExecutor {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        let output = self
            .build_command(program, args)?
            .output()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            debug!("{program} exited with {:?}: {}", output.status.code(), stderr.trim());
            Err(self.failure(output.status.code(), stderr))
        }
    }
}

/// Canned result for commands whose rendering starts with a prefix
#[derive(Debug, Clone)]
struct ScriptedResponse {
    prefix: String,
    result: Result<CommandOutput, (i32, String)>,
}

/// Records commands instead of running them.
///
/// Every command succeeds with empty output unless a scripted response
/// matches its rendering by prefix; the first matching script wins.
#[derive(Debug, Default)]
pub struct StubExecutor {
    executed: Mutex<Vec<String>>,
    scripts: Vec<ScriptedResponse>,
}

impl StubExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands starting with `prefix` with the given stdout
    pub fn with_output(mut self, prefix: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.scripts.push(ScriptedResponse {
            prefix: prefix.into(),
            result: Ok(CommandOutput::with_stdout(stdout)),
        });
        self
    }

    /// Fails commands starting with `prefix` with the given exit code and stderr
    pub fn with_failure(
        mut self,
        prefix: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        self.scripts.push(ScriptedResponse {
            prefix: prefix.into(),
            result: Err((exit_code, stderr.into())),
        });
        self
    }

    /// Every command run so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the recorded commands and starts a fresh log
    pub fn take_executed(&self) -> Vec<String> {
        std::mem::take(&mut *self.executed.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl CommandExecutor for StubExecutor {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        let line = render_command(program, args);
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.clone());

        match self.scripts.iter().find(|s| line.starts_with(&s.prefix)) {
            Some(ScriptedResponse { result: Ok(out), .. }) => Ok(out.clone()),
            Some(ScriptedResponse {
                result: Err((code, stderr)),
                ..
            }) => Err(CommandError::failed(*code, stderr.clone())),
            None => Ok(CommandOutput::default()),
        }
    }
}
