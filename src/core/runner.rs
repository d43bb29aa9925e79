//! External command execution
//!
//! Every process portsync launches (iptables, docker, the OCI CLI, systemctl)
//! goes through [`CommandRunner`]. The system implementation bounds each
//! call with a timeout and kills the child if the budget runs out; tests
//! substitute a scripted fake.

use crate::core::error::{Error, Result};
use crate::elevation::{PrivilegedProgram, create_elevated_command};
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Program to launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    /// Runs through the privilege elevation layer
    Privileged(PrivilegedProgram),
    /// Container engine CLI
    Docker,
    /// Cloud provider CLI
    Oci,
}

impl Program {
    pub const IPTABLES: Program = Program::Privileged(PrivilegedProgram::Iptables);

    pub fn name(&self) -> &'static str {
        match self {
            Program::Privileged(p) => (*p).into(),
            Program::Docker => "docker",
            Program::Oci => "oci",
        }
    }
}

/// A single command line, built without any shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: Program,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: Program, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Program and arguments joined for logs
    pub fn display(&self) -> String {
        format!("{} {}", self.program.name(), self.args.join(" "))
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Converts a non-zero exit into [`Error::Command`].
    pub fn into_result(self, program: Program) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            let stderr = self.stderr.trim().to_string();
            Err(Error::Command {
                program: program.name().to_string(),
                message: if stderr.is_empty() {
                    format!("exited with {:?}", self.exit_code)
                } else {
                    stderr.clone()
                },
                stderr: Some(stderr),
                exit_code: self.exit_code,
            })
        }
    }
}

/// Executes external programs
///
/// A non-zero exit status is a normal [`CommandOutput`], not an error;
/// only failures to launch or finish the process are `Err`.
pub trait CommandRunner: Sync {
    fn run(&self, invocation: &Invocation) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Runs real processes with a per-call timeout
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
    oci_binary: String,
}

impl SystemRunner {
    pub fn new(timeout: Duration, oci_binary: impl Into<String>) -> Self {
        Self {
            timeout,
            oci_binary: oci_binary.into(),
        }
    }

    fn command(&self, invocation: &Invocation) -> Result<Command> {
        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        let cmd = match invocation.program {
            Program::Privileged(program) => create_elevated_command(program, &args)?,
            Program::Docker => {
                let mut cmd = Command::new("docker");
                cmd.args(&args);
                cmd
            }
            Program::Oci => {
                let mut cmd = Command::new(&self.oci_binary);
                cmd.args(&args);
                cmd
            }
        };
        Ok(cmd)
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let name = invocation.program.name();
        debug!("Running: {}", invocation.display());

        let mut cmd = self.command(invocation)?;
        cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Command {
                    program: name.to_string(),
                    message: "command not found in PATH".to_string(),
                    stderr: None,
                    exit_code: None,
                }
            } else {
                Error::Io(e)
            }
        })?;

        // Dropping the future on timeout drops the child, which kills it
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                operation: name.to_string(),
                seconds: self.timeout.as_secs(),
            })??;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs a command, treating a non-zero exit as an error, with up to
/// `retries` further attempts when `should_retry` accepts the failure.
pub async fn run_with_retry<R, F>(
    runner: &R,
    invocation: &Invocation,
    retries: u32,
    should_retry: F,
) -> Result<CommandOutput>
where
    R: CommandRunner,
    F: Fn(&Error) -> bool,
{
    let mut attempt = 0;
    loop {
        let result = match runner.run(invocation).await {
            Ok(output) => output.into_result(invocation.program),
            Err(e) => Err(e),
        };
        match result {
            Err(e) if attempt < retries && should_retry(&e) => {
                attempt += 1;
                warn!(
                    "'{}' failed ({e}), retrying ({attempt}/{retries})",
                    invocation.display()
                );
            }
            other => return other,
        }
    }
}
