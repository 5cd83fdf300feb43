//! Remote command execution over SSH.
//!
//! The [`RemoteShell`] trait decouples convergence logic from the transport.
//! [`SshShell`] spawns the system `ssh` client with key-only authentication;
//! tests use scripted shells that replay exit codes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::io::process::run_command_with_timeout;

/// Exit status `ssh` itself uses for connection-level failures.
pub const TRANSPORT_FAILURE: i32 = 255;

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Remote exit status; `None` when the command was killed or timed out.
    pub code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
    pub timed_out: bool,
}

impl RemoteOutput {
    pub fn exited(code: i32, output: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            output: output.into(),
            timed_out: false,
        }
    }

    /// Exit status, with transport-level failures folded into [`TRANSPORT_FAILURE`].
    pub fn status(&self) -> i32 {
        match self.code {
            Some(code) if !self.timed_out => code,
            _ => TRANSPORT_FAILURE,
        }
    }
}

/// Abstraction over remote command transports.
pub trait RemoteShell {
    /// Private key used to authenticate, if one is configured.
    fn identity(&self) -> Option<&Path>;

    /// Run `command` on `host`. `Err` means the transport could not be started.
    fn exec(&self, host: &str, command: &str) -> Result<RemoteOutput>;
}

impl<R: RemoteShell + ?Sized> RemoteShell for &R {
    fn identity(&self) -> Option<&Path> {
        (**self).identity()
    }

    fn exec(&self, host: &str, command: &str) -> Result<RemoteOutput> {
        (**self).exec(host, command)
    }
}

/// Shell that spawns `ssh -l <user> -i <key> <host> <command>`.
#[derive(Debug, Clone)]
pub struct SshShell {
    user: String,
    identity: Option<PathBuf>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl SshShell {
    pub fn new(
        user: impl Into<String>,
        identity: Option<PathBuf>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            user: user.into(),
            identity,
            timeout,
            output_limit_bytes,
        }
    }

    fn command(&self, identity: &Path, host: &str, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-l")
            .arg(&self.user)
            .arg("-i")
            .arg(identity)
            // Never fall back to interactive password prompts.
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "ConnectTimeout=10"])
            .arg(host)
            .arg(command);
        cmd
    }
}

impl RemoteShell for SshShell {
    fn identity(&self) -> Option<&Path> {
        self.identity.as_deref()
    }

    #[instrument(skip(self), fields(user = %self.user))]
    fn exec(&self, host: &str, command: &str) -> Result<RemoteOutput> {
        let identity = self
            .identity
            .as_deref()
            .ok_or_else(|| anyhow!("no ssh identity configured"))?;
        let output = run_command_with_timeout(
            self.command(identity, host, command),
            self.timeout,
            self.output_limit_bytes,
        )?;
        debug!(exit_code = ?output.status.code(), "ssh finished");
        Ok(RemoteOutput {
            code: output.status.code(),
            output: output.combined(),
            timed_out: output.timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_commands_report_transport_failure() {
        let output = RemoteOutput {
            code: Some(0),
            output: String::new(),
            timed_out: true,
        };
        assert_eq!(output.status(), TRANSPORT_FAILURE);
        assert_eq!(RemoteOutput::exited(1, "").status(), 1);
    }

    #[test]
    fn ssh_shell_without_identity_refuses_to_run() {
        let shell = SshShell::new("root", None, Duration::from_secs(1), 100);
        assert!(shell.identity().is_none());
        let err = shell.exec("example.invalid", "true").unwrap_err();
        assert!(err.to_string().contains("no ssh identity"));
    }

    #[test]
    fn ssh_command_uses_key_and_batch_mode() {
        let shell = SshShell::new(
            "root",
            Some(PathBuf::from("/keys/id_rsa")),
            Duration::from_secs(1),
            100,
        );
        let cmd = shell.command(Path::new("/keys/id_rsa"), "db1", "cat /etc/ec2/created");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(&args[..4], ["-l", "root", "-i", "/keys/id_rsa"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("cat /etc/ec2/created"));
    }
}
