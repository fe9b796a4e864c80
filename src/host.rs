// ABOUTME: Execution of host tools (losetup, mount, docker compose, aria2c) as child processes.
// ABOUTME: Defines the Host trait and LocalHost, which runs commands through tokio.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;

/// A program invocation with its arguments. Never interpreted by a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
    stream_output: bool,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stream_output: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Let the child write straight to our stdout/stderr instead of capturing.
    /// Used for long-running tools whose progress is useful to the operator.
    pub fn stream_output(mut self) -> Self {
        self.stream_output = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn is_streamed(&self) -> bool {
        self.stream_output
    }

    /// Value following `flag` in the argument list, if any.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

impl HostError {
    /// Exit code of the failed tool, when it ran at all.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            HostError::Failed { exit_code, .. } => Some(*exit_code),
            HostError::Spawn { .. } => None,
        }
    }
}

/// The machine hosting the deployments.
///
/// Every external tool goes through `exec`, which keeps the orchestration
/// logic testable against a scripted host.
#[async_trait]
pub trait Host: Send + Sync {
    /// Run a command to completion. A non-zero exit is not an error here.
    async fn exec(&self, command: &CommandLine) -> Result<CommandOutput, HostError>;

    /// Whether the current process has root privileges.
    fn is_root(&self) -> bool;

    /// Run a command, turning a non-zero exit into [`HostError::Failed`].
    async fn run(&self, command: &CommandLine) -> Result<CommandOutput, HostError> {
        let output = self.exec(command).await?;
        if output.success() {
            return Ok(output);
        }
        tracing::error!(
            "`{}` exited with code {}:\n{}{}",
            command,
            output.exit_code,
            output.stdout,
            output.stderr
        );
        Err(HostError::Failed {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }

    /// Run a command whose failure is only logged. Returns whether it succeeded.
    async fn run_failsafe(&self, command: &CommandLine) -> bool {
        match self.exec(command).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                tracing::warn!(
                    "`{}` exited with code {} (ignored): {}",
                    command,
                    output.exit_code,
                    output.stderr.trim()
                );
                false
            }
            Err(e) => {
                tracing::warn!("{} (ignored)", e);
                false
            }
        }
    }
}

/// Runs commands on the local machine with a C locale, so tool output is stable.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHost;

#[async_trait]
impl Host for LocalHost {
    async fn exec(&self, command: &CommandLine) -> Result<CommandOutput, HostError> {
        tracing::debug!("Running `{}`", command);

        let (stdout, stderr) = if command.is_streamed() {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::piped(), Stdio::piped())
        };

        let output = Command::new(command.program())
            .args(command.get_args())
            .env("LANG", "C")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .output()
            .await
            .map_err(|source| HostError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let result = CommandOutput {
            // Killed by a signal: report like a shell would.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.stdout.is_empty() {
            tracing::trace!("stdout of `{}`:\n{}", command, result.stdout);
        }

        Ok(result)
    }

    fn is_root(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}
